//! In-memory datagram network for deterministic tests.
//!
//! Sockets bound on a [`SimNetwork`] deliver into per-address queues. Loss
//! and duplication are drawn from a seeded RNG so a failing run replays
//! exactly. Frames can also be injected with any source address, which is
//! how spoofing is exercised.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::socket::DatagramSocket;

type Datagram = (SocketAddr, Vec<u8>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub delivered: u64,
}

struct NetInner {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    loss: f64,
    duplicate: f64,
    rng: StdRng,
    stats: SimStats,
}

#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetInner {
                queues: HashMap::new(),
                loss: 0.0,
                duplicate: 0.0,
                rng: StdRng::seed_from_u64(seed),
                stats: SimStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a socket at `addr`. Rebinding an address clears its queue.
    pub fn bind(&self, addr: SocketAddr) -> SimSocket {
        self.lock().queues.insert(addr, VecDeque::new());
        SimSocket { net: self.clone(), addr }
    }

    /// Probability in `0.0..=1.0` that a datagram is dropped.
    pub fn set_loss(&self, p: f64) {
        self.lock().loss = p.clamp(0.0, 1.0);
    }

    /// Probability in `0.0..=1.0` that a delivered datagram arrives twice.
    pub fn set_duplicate(&self, p: f64) {
        self.lock().duplicate = p.clamp(0.0, 1.0);
    }

    /// Deliver `bytes` to `to` as if sent from `from`, bypassing loss.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        if let Some(queue) = self.lock().queues.get_mut(&to) {
            queue.push_back((from, bytes.to_vec()));
        }
    }

    /// Datagrams waiting for `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().queues.get(&addr).map_or(0, VecDeque::len)
    }

    /// Take everything queued for `addr` without delivering it.
    pub fn drain(&self, addr: SocketAddr) -> Vec<Datagram> {
        self.lock()
            .queues
            .get_mut(&addr)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    fn transmit(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let mut net = self.lock();
        let net = &mut *net;
        net.stats.sent += 1;
        if net.loss > 0.0 && net.rng.gen_bool(net.loss) {
            net.stats.dropped += 1;
            return;
        }
        let twice = net.duplicate > 0.0 && net.rng.gen_bool(net.duplicate);
        // Unbound destinations swallow the datagram, like a closed port.
        let Some(queue) = net.queues.get_mut(&to) else {
            return;
        };
        queue.push_back((from, bytes.to_vec()));
        net.stats.delivered += 1;
        if twice {
            queue.push_back((from, bytes.to_vec()));
            net.stats.duplicated += 1;
        }
    }
}

pub struct SimSocket {
    net: SimNetwork,
    addr: SocketAddr,
}

impl DatagramSocket for SimSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.net.transmit(self.addr, target, buf);
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let next = self.net.lock().queues.get_mut(&self.addr).and_then(VecDeque::pop_front);
        match next {
            Some((from, data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn delivers_in_order_and_reports_would_block() {
        let net = SimNetwork::new(1);
        let a = net.bind(addr(1));
        let b = net.bind(addr(2));
        a.send_to(b"one", addr(2)).unwrap();
        a.send_to(b"two", addr(2)).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!((&buf[..n], from), (&b"one"[..], addr(1)));
        let (n, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(b.recv_from(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn loss_is_reproducible_from_the_seed() {
        let run = |seed| {
            let net = SimNetwork::new(seed);
            net.set_loss(0.5);
            let a = net.bind(addr(1));
            let _b = net.bind(addr(2));
            for _ in 0..200 {
                a.send_to(b"x", addr(2)).unwrap();
            }
            net.stats()
        };
        let first = run(7);
        assert_eq!(first, run(7));
        assert!(first.dropped > 50 && first.dropped < 150, "{first:?}");
        assert_eq!(first.dropped + first.delivered, 200);
    }

    #[test]
    fn full_duplication_doubles_every_datagram() {
        let net = SimNetwork::new(3);
        net.set_duplicate(2.0);
        let a = net.bind(addr(1));
        let _b = net.bind(addr(2));
        a.send_to(b"x", addr(2)).unwrap();
        assert_eq!(net.pending(addr(2)), 2);
        assert_eq!(net.stats().duplicated, 1);
    }

    #[test]
    fn injected_frames_carry_the_claimed_source() {
        let net = SimNetwork::new(0);
        let b = net.bind(addr(2));
        net.inject(addr(99), addr(2), b"spoof");
        let mut buf = [0u8; 8];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"spoof");
        assert_eq!(from, addr(99));
    }
}
