//! Deadline-bucketed wake scheduling.
//!
//! Entries are grouped by deadline in a `BTreeMap`. The earliest deadline
//! is cached so the common "nothing due yet" case is a single comparison.

use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug)]
pub struct TimerWheel<T> {
    buckets: BTreeMap<u64, Vec<T>>,
    /// Earliest deadline present, `u64::MAX` when empty.
    min_time: u64,
    len: usize,
}

impl<T: PartialEq> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            min_time: u64::MAX,
            len: 0,
        }
    }

    /// Wake `id` at `deadline`. Duplicate entries are kept.
    pub fn schedule(&mut self, deadline: u64, id: T) {
        self.buckets.entry(deadline).or_default().push(id);
        self.min_time = self.min_time.min(deadline);
        self.len += 1;
    }

    /// Move every entry with `deadline <= now` into `out`, earliest first.
    pub fn expire_into<E: Extend<T>>(&mut self, now: u64, out: &mut E) -> usize {
        if now < self.min_time {
            return 0;
        }
        let mut fired = 0;
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now {
                break;
            }
            let ids = entry.remove();
            fired += ids.len();
            out.extend(ids);
        }
        self.len -= fired;
        self.min_time = self.next_deadline().unwrap_or(u64::MAX);
        fired
    }

    pub fn expire(&mut self, now: u64) -> Vec<T> {
        let mut out = Vec::new();
        self.expire_into(now, &mut out);
        out
    }

    /// Drop every pending entry for `id`. Returns how many were removed.
    pub fn cancel(&mut self, id: &T) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, ids| {
            let before = ids.len();
            ids.retain(|x| x != id);
            removed += before - ids.len();
            !ids.is_empty()
        });
        self.len -= removed;
        self.min_time = self.next_deadline().unwrap_or(u64::MAX);
        removed
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: PartialEq> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic millisecond clock starting at zero.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
