//! Single-threaded execution point for a service.
//!
//! Any task or thread may `post` a closure through a [`PollerHandle`]. The
//! owner drains the queue with [`Poller::run_once`] and runs every closure
//! against its context in the order they were drained, so service state is
//! only ever touched from one place.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;

/// A unit of work run against the loop's context. Must not block.
pub type Action<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Producer side. Cheap to clone; usable from any thread.
pub struct PollerHandle<C> {
    tx: mpsc::UnboundedSender<Action<C>>,
}

impl<C> Clone for PollerHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: 'static> PollerHandle<C> {
    /// Queue `action`. Returns false once the poller is gone.
    pub fn post<F>(&self, action: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(action)).is_ok()
    }
}

pub struct Poller<C> {
    tx: mpsc::UnboundedSender<Action<C>>,
    rx: mpsc::UnboundedReceiver<Action<C>>,
    local: VecDeque<Action<C>>,
}

impl<C: 'static> Poller<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, local: VecDeque::new() }
    }

    pub fn handle(&self) -> PollerHandle<C> {
        PollerHandle { tx: self.tx.clone() }
    }

    /// Drain everything posted so far and run it. Actions posted while
    /// this runs wait for the next call. Returns the number executed.
    pub fn run_once(&mut self, ctx: &mut C) -> usize {
        while let Ok(action) = self.rx.try_recv() {
            self.local.push_back(action);
        }
        let count = self.local.len();
        while let Some(action) = self.local.pop_front() {
            action(ctx);
        }
        count
    }

    /// Suspend until an action is queued or `timeout` passes. Returns true
    /// if work is ready.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        if !self.local.is_empty() {
            return true;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(action)) => {
                self.local.push_back(action);
                true
            }
            _ => false,
        }
    }
}

impl<C: 'static> Default for Poller<C> {
    fn default() -> Self {
        Self::new()
    }
}
