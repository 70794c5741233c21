//! Accept-side bookkeeping for the SYN/ACK exchange.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;

use sluice_core::wire::MIN_CONN_ID;

/// Draws before giving up on finding a free connection id.
const ALLOCATE_ATTEMPTS: usize = 64;

/// Accept-side channels by the peer that opened them.
///
/// An entry lives as long as its channel, so a SYN that arrives late or
/// twice maps back to the channel it already created instead of opening
/// another one.
#[derive(Debug, Default)]
pub(crate) struct AcceptTracker {
    by_peer: HashMap<(SocketAddr, u32), u32>,
}

impl AcceptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: SocketAddr, remote_conn: u32, local_conn: u32) {
        self.by_peer.insert((peer, remote_conn), local_conn);
    }

    /// Local id of the channel `peer` opened with `remote_conn`.
    pub fn find(&self, peer: SocketAddr, remote_conn: u32) -> Option<u32> {
        self.by_peer.get(&(peer, remote_conn)).copied()
    }

    /// Forget the entry for `local_conn`, whatever address it was under.
    pub fn remove(&mut self, local_conn: u32) {
        self.by_peer.retain(|_, local| *local != local_conn);
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }
}

/// Pick a random connection id `>= MIN_CONN_ID` for which `in_use` is
/// false.
pub(crate) fn allocate_conn<R: Rng>(rng: &mut R, in_use: impl Fn(u32) -> bool) -> Option<u32> {
    (0..ALLOCATE_ATTEMPTS)
        .map(|_| rng.gen_range(MIN_CONN_ID..=u32::MAX))
        .find(|conn| !in_use(*conn))
}
