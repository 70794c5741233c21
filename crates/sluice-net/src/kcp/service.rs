use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;

use sluice_core::config::KcpSettings;
use sluice_core::kcp::Kcp;
use sluice_core::wire::{ErrorCode, Frame, MIN_CONN_ID};

use super::channel::{ChannelState, KcpChannel, Link, Role};
use super::handshake::{allocate_conn, AcceptTracker};
use crate::service::{ChannelId, ServiceEvent, Transport, TransportError};
use crate::socket::{bind_udp, DatagramSocket};
use crate::timer::{Clock, TimerWheel};

/// Largest datagram read off the socket.
const RECV_BUFFER: usize = 64 * 1024;

/// Reliable channels multiplexed over one datagram socket.
///
/// Nothing here blocks or spawns: the owner calls [`KcpService::update`]
/// (or `tick`/`poll`) and everything due runs inline. Channels are keyed
/// by their local connection id, which is also their [`ChannelId`].
pub struct KcpService<S: DatagramSocket> {
    socket: S,
    local_addr: SocketAddr,
    settings: KcpSettings,
    channels: HashMap<u32, KcpChannel>,
    accepts: AcceptTracker,
    /// Channels to update before the current `update` returns.
    immediate: BTreeSet<u32>,
    timers: TimerWheel<u32>,
    removals: Vec<(u32, ErrorCode)>,
    events: VecDeque<ServiceEvent>,
    clock: Clock,
    now: u64,
    rng: StdRng,
    recv_buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl<S: DatagramSocket> KcpService<S> {
    pub fn new(socket: S, settings: KcpSettings) -> Result<Self, TransportError> {
        Self::with_rng(socket, settings, StdRng::from_entropy())
    }

    /// Like [`new`](Self::new) with a caller-seeded id generator.
    pub fn with_rng(socket: S, settings: KcpSettings, rng: StdRng) -> Result<Self, TransportError> {
        // Reject bad engine parameters here rather than on the first SYN.
        Kcp::new(0, &settings.engine())?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            settings,
            channels: HashMap::new(),
            accepts: AcceptTracker::new(),
            immediate: BTreeSet::new(),
            timers: TimerWheel::new(),
            removals: Vec::new(),
            events: VecDeque::new(),
            clock: Clock::new(),
            now: 0,
            rng,
            recv_buf: vec![0u8; RECV_BUFFER],
            scratch: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &KcpSettings {
        &self.settings
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Service time of the last update, in ms.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Earliest time any channel needs an update.
    pub fn next_wake(&self) -> Option<u64> {
        if !self.immediate.is_empty() || !self.removals.is_empty() {
            return Some(self.now);
        }
        self.timers.next_deadline()
    }

    /// `(local_conn, remote_conn)`; the remote id is 0 until learned.
    pub fn channel_conns(&self, channel: ChannelId) -> Option<(u32, u32)> {
        let ch = self.channels.get(&conn_of(channel)?)?;
        Some((ch.local_conn(), ch.remote_conn()))
    }

    pub fn state(&self, channel: ChannelId) -> Option<ChannelState> {
        Some(self.channels.get(&conn_of(channel)?)?.state())
    }

    pub fn remote(&self, channel: ChannelId) -> Option<SocketAddr> {
        Some(self.channels.get(&conn_of(channel)?)?.remote())
    }

    /// Point `channel` at a new peer address. Returns false if unknown.
    pub fn change_address(&mut self, channel: ChannelId, addr: SocketAddr) -> bool {
        let Some(conn) = conn_of(channel) else {
            return false;
        };
        let Some(ch) = self.channels.get_mut(&conn) else {
            return false;
        };
        tracing::debug!(conn, from = %ch.remote(), to = %addr, "kcp address changed");
        ch.set_remote(addr);
        true
    }

    /// One service step at time `now` (ms, monotonic): read every waiting
    /// datagram, run channels whose wake time has come or that saw
    /// traffic, then dispose of channels that failed along the way.
    pub fn update(&mut self, now: u64) {
        self.now = now;
        self.receive();
        self.timers.expire_into(now, &mut self.immediate);
        for conn in std::mem::take(&mut self.immediate) {
            self.update_channel(conn);
        }
        self.dispose_removed();
    }

    /// Close every channel with `ServiceDisposed`. Peers get FINs and the
    /// application gets a `Failed` event per channel.
    pub fn shutdown(&mut self) {
        let conns: Vec<u32> = self.channels.keys().copied().collect();
        if !conns.is_empty() {
            tracing::info!(addr = %self.local_addr, channels = conns.len(), "kcp service shutting down");
        }
        for conn in conns {
            self.dispose(conn, ErrorCode::ServiceDisposed, true);
        }
        self.removals.clear();
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    fn receive(&mut self) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP unreachable surfacing on the shared socket.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "udp receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::parse(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(from = %from, error = %e, "datagram dropped");
                return;
            }
        };
        match frame {
            Frame::Syn { sender } => self.on_syn(sender, from),
            Frame::Ack { sender, receiver } => self.on_ack(sender, receiver),
            Frame::Fin { sender, receiver, error } => self.on_fin(sender, receiver, error),
            Frame::Msg { sender, receiver, payload } => self.on_msg(sender, receiver, payload, from),
        }
    }

    fn on_syn(&mut self, sender: u32, from: SocketAddr) {
        if sender < MIN_CONN_ID {
            tracing::trace!(from = %from, sender, "syn with reserved id dropped");
            return;
        }
        if let Some(local) = self.accepts.find(from, sender) {
            let handshaking = self
                .channels
                .get(&local)
                .map_or(false, |ch| ch.state() == ChannelState::Handshaking);
            if handshaking {
                tracing::debug!(conn = local, remote_conn = sender, "duplicate syn, ack resent");
                Link::new(&self.socket, &mut self.scratch).send_ack(from, local, sender);
            }
            return;
        }

        let channels = &self.channels;
        let Some(local) = allocate_conn(&mut self.rng, |conn| channels.contains_key(&conn)) else {
            tracing::warn!(from = %from, "no free connection id, syn dropped");
            return;
        };
        let channel = match KcpChannel::accept(local, sender, from, self.now, &self.settings) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(error = %e, "cannot create kcp engine");
                return;
            }
        };
        self.channels.insert(local, channel);
        self.accepts.add(from, sender, local);
        self.immediate.insert(local);
        self.events.push_back(ServiceEvent::Accepted { channel: channel_id(local), remote: from });
        tracing::info!(conn = local, remote_conn = sender, remote = %from, "kcp channel accepted");
    }

    fn on_ack(&mut self, sender: u32, receiver: u32) {
        if sender < MIN_CONN_ID {
            tracing::trace!(sender, "ack with reserved id dropped");
            return;
        }
        let Some(ch) = self.channels.get_mut(&receiver) else {
            tracing::trace!(conn = receiver, "ack for unknown channel dropped");
            return;
        };
        let mut link = Link::new(&self.socket, &mut self.scratch);
        match ch.on_ack(sender, &self.settings, &mut link) {
            Ok(true) => {
                self.immediate.insert(receiver);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(conn = receiver, error = %e, "cannot create kcp engine"),
        }
        if let Some(code) = link.take_error() {
            self.mark_removal(receiver, code);
        }
    }

    fn on_fin(&mut self, sender: u32, receiver: u32, error: ErrorCode) {
        let Some(ch) = self.channels.get(&receiver) else {
            tracing::trace!(conn = receiver, "fin for unknown channel dropped");
            return;
        };
        if ch.remote_conn() == 0 || ch.remote_conn() != sender {
            tracing::trace!(conn = receiver, sender, expected = ch.remote_conn(), "fin from wrong peer ignored");
            return;
        }
        tracing::debug!(conn = receiver, remote_conn = sender, peer_error = %error, "fin received");
        self.mark_removal(receiver, ErrorCode::PeerDisconnect);
    }

    fn on_msg(&mut self, sender: u32, receiver: u32, payload: &[u8], from: SocketAddr) {
        let Some(ch) = self.channels.get_mut(&receiver) else {
            tracing::trace!(conn = receiver, from = %from, "msg for unknown channel, fin sent");
            Link::new(&self.socket, &mut self.scratch).send_fin(from, receiver, sender, ErrorCode::ChannelNotFound);
            return;
        };
        if ch.remote_conn() == 0 || ch.remote_conn() != sender {
            tracing::trace!(conn = receiver, sender, expected = ch.remote_conn(), "msg from wrong peer ignored");
            return;
        }
        if matches!(ch.state(), ChannelState::Closing | ChannelState::Disposed) {
            return;
        }
        if let Err(e) = ch.on_msg(payload, &mut self.events) {
            tracing::debug!(conn = receiver, error = %e, "segment rejected");
        }
        self.immediate.insert(receiver);
    }

    // ── Scheduling and teardown ──────────────────────────────────────────────

    fn update_channel(&mut self, conn: u32) {
        let Some(ch) = self.channels.get_mut(&conn) else {
            return;
        };
        let mut link = Link::new(&self.socket, &mut self.scratch);
        match ch.update(self.now, &self.settings, &mut link) {
            Ok(Some(wake)) => self.timers.schedule(wake.max(self.now + 1), conn),
            Ok(None) => {}
            Err(code) => self.mark_removal(conn, code),
        }
    }

    /// Flag `conn` for disposal at the end of the current update. The
    /// first reason recorded wins.
    fn mark_removal(&mut self, conn: u32, error: ErrorCode) {
        let Some(ch) = self.channels.get_mut(&conn) else {
            return;
        };
        if ch.state() == ChannelState::Closing {
            return;
        }
        ch.mark_closing();
        self.removals.push((conn, error));
        tracing::debug!(conn, error = %error, "kcp channel marked for removal");
    }

    fn dispose_removed(&mut self) {
        for (conn, error) in std::mem::take(&mut self.removals) {
            self.dispose(conn, error, true);
        }
    }

    /// Drop `conn` from every table and close it. A peer that sent the FIN
    /// itself is not sent one back.
    fn dispose(&mut self, conn: u32, error: ErrorCode, notify_app: bool) {
        let Some(mut ch) = self.channels.remove(&conn) else {
            return;
        };
        if ch.role() == Role::Accept {
            self.accepts.remove(conn);
        }
        self.timers.cancel(&conn);
        self.immediate.remove(&conn);

        let mut link = Link::new(&self.socket, &mut self.scratch);
        ch.close(error, error != ErrorCode::PeerDisconnect, &self.settings, &mut link);
        if notify_app {
            self.events.push_back(ServiceEvent::Failed { channel: ch.id(), error });
        }
        tracing::info!(conn, remote = %ch.remote(), error = %error, "kcp channel closed");
    }
}

impl<S: DatagramSocket> Transport for KcpService<S> {
    fn connect(&mut self, addr: &str) -> Result<ChannelId, TransportError> {
        let remote: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        let channels = &self.channels;
        let conn = allocate_conn(&mut self.rng, |conn| channels.contains_key(&conn))
            .ok_or(TransportError::ConnIdExhausted)?;
        self.channels.insert(conn, KcpChannel::connect(conn, remote, self.now));
        tracing::debug!(conn, remote = %remote, "kcp connecting");
        // Sends the first SYN now.
        self.update_channel(conn);
        self.dispose_removed();
        Ok(channel_id(conn))
    }

    fn send(&mut self, channel: ChannelId, packet: &[u8]) -> Result<(), TransportError> {
        let conn = conn_of(channel).ok_or(TransportError::UnknownChannel(channel))?;
        let ch = self
            .channels
            .get_mut(&conn)
            .ok_or(TransportError::UnknownChannel(channel))?;
        match ch.send(packet, &self.settings) {
            Ok(()) => {
                self.immediate.insert(conn);
                Ok(())
            }
            Err(TransportError::Failed(code)) => {
                tracing::warn!(conn, error = %code, "kcp send backlog overflow");
                self.mark_removal(conn, code);
                Err(TransportError::Failed(code))
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&mut self, channel: ChannelId) -> bool {
        let Some(conn) = conn_of(channel).filter(|conn| self.channels.contains_key(conn)) else {
            return false;
        };
        self.removals.retain(|(c, _)| *c != conn);
        self.dispose(conn, ErrorCode::LocalClose, false);
        true
    }

    fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.update(now);
    }

    fn poll_event(&mut self) -> Option<ServiceEvent> {
        self.events.pop_front()
    }
}

impl<S: DatagramSocket> Drop for KcpService<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl KcpService<UdpSocket> {
    /// Bind a UDP socket on `addr` and serve on it. Must be called inside a
    /// tokio runtime.
    pub fn bind(addr: SocketAddr, settings: KcpSettings, buffer_bytes: usize) -> Result<Self, TransportError> {
        let socket = bind_udp(addr, buffer_bytes)?;
        let service = Self::new(socket, settings)?;
        tracing::info!(addr = %service.local_addr, "kcp service bound");
        Ok(service)
    }

    /// Wait until a datagram arrives, a channel is due, or `max_wait`
    /// passes; then tick.
    pub async fn poll(&mut self, max_wait: Duration) {
        let wait = match self.next_wake() {
            Some(wake) => Duration::from_millis(wake.saturating_sub(self.clock.now_ms())).min(max_wait),
            None => max_wait,
        };
        if !wait.is_zero() {
            let _ = tokio::time::timeout(wait, self.socket.readable()).await;
        }
        self.tick();
    }
}

fn channel_id(conn: u32) -> ChannelId {
    ChannelId(u64::from(conn))
}

fn conn_of(channel: ChannelId) -> Option<u32> {
    u32::try_from(channel.0).ok()
}
