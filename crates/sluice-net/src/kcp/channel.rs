use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use zerocopy::AsBytes;

use sluice_core::config::KcpSettings;
use sluice_core::kcp::{time_diff, Kcp, KcpError};
use sluice_core::wire::{encode_msg, AckFrame, ErrorCode, FinFrame, SynFrame};

use crate::service::{ChannelId, ServiceEvent, TransportError};
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the peer: ACK on the connect side, first MSG on the
    /// accept side.
    Handshaking,
    Established,
    /// Failed or closed, waiting for the service to dispose it.
    Closing,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Connect,
    Accept,
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// Borrowed view of the shared socket used for one burst of sends.
///
/// A full send queue drops the datagram, which the engine recovers from.
/// Any other send failure is remembered so the caller can fail the channel.
pub(crate) struct Link<'a, S> {
    socket: &'a S,
    scratch: &'a mut Vec<u8>,
    error: Option<ErrorCode>,
}

impl<'a, S: DatagramSocket> Link<'a, S> {
    pub fn new(socket: &'a S, scratch: &'a mut Vec<u8>) -> Self {
        Self { socket, scratch, error: None }
    }

    fn record(&mut self, result: io::Result<usize>, to: SocketAddr) {
        match result {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(to = %to, "udp send queue full, datagram dropped");
            }
            Err(e) => {
                tracing::warn!(to = %to, error = %e, "udp send failed");
                self.error.get_or_insert(ErrorCode::from_io(&e));
            }
        }
    }

    pub fn send_syn(&mut self, to: SocketAddr, sender: u32) {
        let result = self.socket.send_to(SynFrame::new(sender).as_bytes(), to);
        self.record(result, to);
    }

    pub fn send_ack(&mut self, to: SocketAddr, sender: u32, receiver: u32) {
        let result = self.socket.send_to(AckFrame::new(sender, receiver).as_bytes(), to);
        self.record(result, to);
    }

    pub fn send_fin(&mut self, to: SocketAddr, sender: u32, receiver: u32, error: ErrorCode) {
        let result = self.socket.send_to(FinFrame::new(sender, receiver, error).as_bytes(), to);
        self.record(result, to);
    }

    pub fn send_msg(&mut self, to: SocketAddr, sender: u32, receiver: u32, payload: &[u8]) {
        self.scratch.clear();
        encode_msg(&mut *self.scratch, sender, receiver, payload);
        let result = self.socket.send_to(self.scratch.as_slice(), to);
        self.record(result, to);
    }

    pub fn take_error(&mut self) -> Option<ErrorCode> {
        self.error.take()
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// One reliable conversation multiplexed on the service socket.
#[derive(Debug)]
pub(crate) struct KcpChannel {
    local_conn: u32,
    /// 0 until the connect side learns it from the ACK.
    remote_conn: u32,
    remote: SocketAddr,
    role: Role,
    state: ChannelState,
    kcp: Option<Kcp>,
    /// Payloads accepted before the engine exists.
    pending: VecDeque<Bytes>,
    created_at: u64,
    next_retry: u64,
}

impl KcpChannel {
    /// Connect side. The first `update` sends the SYN.
    pub fn connect(local_conn: u32, remote: SocketAddr, now: u64) -> Self {
        Self {
            local_conn,
            remote_conn: 0,
            remote,
            role: Role::Connect,
            state: ChannelState::Handshaking,
            kcp: None,
            pending: VecDeque::new(),
            created_at: now,
            next_retry: now,
        }
    }

    /// Accept side, created on a SYN. The engine exists from the start and
    /// shares the connector's id as its conversation.
    pub fn accept(
        local_conn: u32,
        remote_conn: u32,
        remote: SocketAddr,
        now: u64,
        settings: &KcpSettings,
    ) -> Result<Self, KcpError> {
        Ok(Self {
            local_conn,
            remote_conn,
            remote,
            role: Role::Accept,
            state: ChannelState::Handshaking,
            kcp: Some(Kcp::new(remote_conn, &settings.engine())?),
            pending: VecDeque::new(),
            created_at: now,
            next_retry: now,
        })
    }

    pub fn id(&self) -> ChannelId {
        ChannelId(u64::from(self.local_conn))
    }

    pub fn local_conn(&self) -> u32 {
        self.local_conn
    }

    pub fn remote_conn(&self) -> u32 {
        self.remote_conn
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn mark_closing(&mut self) {
        if self.state != ChannelState::Disposed {
            self.state = ChannelState::Closing;
        }
    }

    /// Queue one message. Fails with `SendWindowOverflow` once more than
    /// twice the send window is waiting.
    pub fn send(&mut self, data: &[u8], settings: &KcpSettings) -> Result<(), TransportError> {
        let limit = 2 * settings.send_window as usize;
        let id = self.id();
        match self.state {
            ChannelState::Handshaking => {
                Kcp::check_message(&settings.engine(), data.len())?;
                self.pending.push_back(Bytes::copy_from_slice(data));
                if self.pending.len() > limit {
                    return Err(TransportError::Failed(ErrorCode::SendWindowOverflow));
                }
                Ok(())
            }
            ChannelState::Established => {
                let kcp = self.kcp.as_mut().ok_or(TransportError::ChannelClosed(id))?;
                kcp.send(data)?;
                if kcp.wait_snd() > 2 * kcp.snd_wnd() as usize {
                    return Err(TransportError::Failed(ErrorCode::SendWindowOverflow));
                }
                Ok(())
            }
            ChannelState::Closing | ChannelState::Disposed => Err(TransportError::ChannelClosed(id)),
        }
    }

    /// ACK from the acceptor. Returns true if the channel just became
    /// established.
    pub fn on_ack<S: DatagramSocket>(
        &mut self,
        sender: u32,
        settings: &KcpSettings,
        link: &mut Link<'_, S>,
    ) -> Result<bool, KcpError> {
        if self.role != Role::Connect {
            tracing::trace!(conn = self.local_conn, "ack on accept-side channel ignored");
            return Ok(false);
        }
        match self.state {
            ChannelState::Handshaking => {
                let mut kcp = Kcp::new(self.local_conn, &settings.engine())?;
                while let Some(data) = self.pending.pop_front() {
                    if let Err(e) = kcp.send(&data) {
                        tracing::warn!(conn = self.local_conn, error = %e, "queued message dropped");
                    }
                }
                self.remote_conn = sender;
                self.kcp = Some(kcp);
                self.state = ChannelState::Established;
                // Lets the acceptor leave its handshake even with nothing queued.
                link.send_msg(self.remote, self.local_conn, self.remote_conn, &[]);
                tracing::info!(
                    conn = self.local_conn,
                    remote_conn = sender,
                    remote = %self.remote,
                    "kcp channel established"
                );
                Ok(true)
            }
            ChannelState::Established if sender == self.remote_conn => {
                link.send_msg(self.remote, self.local_conn, self.remote_conn, &[]);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// MSG from the peer, already checked against `remote_conn`. Every
    /// completed message is queued as a `Received` event.
    pub fn on_msg(&mut self, payload: &[u8], events: &mut VecDeque<ServiceEvent>) -> Result<(), KcpError> {
        if self.state == ChannelState::Handshaking && self.role == Role::Accept {
            if let Some(kcp) = self.kcp.as_mut() {
                while let Some(data) = self.pending.pop_front() {
                    if let Err(e) = kcp.send(&data) {
                        tracing::warn!(conn = self.local_conn, error = %e, "queued message dropped");
                    }
                }
            }
            self.state = ChannelState::Established;
            tracing::info!(conn = self.local_conn, remote = %self.remote, "kcp channel established");
        }
        if self.state != ChannelState::Established || payload.is_empty() {
            return Ok(());
        }
        let Some(kcp) = self.kcp.as_mut() else {
            return Ok(());
        };
        kcp.input(payload)?;
        let channel = ChannelId(u64::from(self.local_conn));
        while let Some(packet) = kcp.recv() {
            events.push_back(ServiceEvent::Received { channel, packet });
        }
        Ok(())
    }

    /// Run due work. Returns the next time this channel wants an update,
    /// or an error code if it has failed.
    pub fn update<S: DatagramSocket>(
        &mut self,
        now: u64,
        settings: &KcpSettings,
        link: &mut Link<'_, S>,
    ) -> Result<Option<u64>, ErrorCode> {
        match self.state {
            ChannelState::Handshaking => {
                let deadline = self.created_at + settings.handshake_timeout_ms;
                if now >= deadline {
                    return Err(match self.role {
                        Role::Connect => ErrorCode::ConnectTimeout,
                        Role::Accept => ErrorCode::AcceptTimeout,
                    });
                }
                if now >= self.next_retry {
                    match self.role {
                        Role::Connect => {
                            link.send_syn(self.remote, self.local_conn);
                            self.next_retry = now + settings.connect_retry_ms;
                        }
                        Role::Accept => {
                            link.send_ack(self.remote, self.local_conn, self.remote_conn);
                            self.next_retry = now + settings.accept_retry_ms;
                        }
                    }
                }
                if let Some(code) = link.take_error() {
                    return Err(code);
                }
                Ok(Some(self.next_retry.min(deadline)))
            }
            ChannelState::Established => {
                let Some(kcp) = self.kcp.as_mut() else {
                    return Ok(None);
                };
                let (local, remote_conn, remote) = (self.local_conn, self.remote_conn, self.remote);
                // The engine clock is the low 32 bits of the service clock.
                let now32 = now as u32;
                kcp.update(now32, |segment| link.send_msg(remote, local, remote_conn, segment));
                if let Some(code) = link.take_error() {
                    return Err(code);
                }
                if kcp.is_dead() {
                    return Err(ErrorCode::PeerUnreachable);
                }
                let wait = time_diff(kcp.check(now32), now32).max(0) as u64;
                Ok(Some(now + wait))
            }
            ChannelState::Closing | ChannelState::Disposed => Ok(None),
        }
    }

    /// Tear down: flush what the engine holds, tell the peer with
    /// `fin_repeat` FINs when `notify_peer` is set and its id is known, and
    /// drop the engine.
    pub fn close<S: DatagramSocket>(
        &mut self,
        error: ErrorCode,
        notify_peer: bool,
        settings: &KcpSettings,
        link: &mut Link<'_, S>,
    ) {
        if self.state == ChannelState::Disposed {
            return;
        }
        let (local, remote_conn, remote) = (self.local_conn, self.remote_conn, self.remote);
        if let Some(kcp) = self.kcp.as_mut() {
            if remote_conn != 0 && notify_peer {
                kcp.flush(&mut |segment: &[u8]| link.send_msg(remote, local, remote_conn, segment));
            }
        }
        if notify_peer && remote_conn != 0 {
            for _ in 0..settings.fin_repeat {
                link.send_fin(remote, local, remote_conn, error);
            }
            tracing::debug!(conn = local, remote_conn, error = %error, "fin sent");
        }
        self.kcp = None;
        self.pending.clear();
        self.state = ChannelState::Disposed;
    }

    #[cfg(test)]
    pub(crate) fn wait_snd(&self) -> usize {
        self.kcp.as_ref().map_or(self.pending.len(), Kcp::wait_snd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimNetwork, SimSocket};
    use sluice_core::wire::Frame;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    struct Rig {
        net: SimNetwork,
        socket: SimSocket,
        scratch: Vec<u8>,
        settings: KcpSettings,
    }

    impl Rig {
        fn new() -> Self {
            let net = SimNetwork::new(1);
            let socket = net.bind(addr(1));
            net.bind(addr(2));
            Self { net, socket, scratch: Vec::new(), settings: KcpSettings::default() }
        }

        fn link(&mut self) -> Link<'_, SimSocket> {
            Link::new(&self.socket, &mut self.scratch)
        }

        /// Frames that reached the peer at `addr(2)`, decoded to tags.
        fn sent(&self) -> Vec<u8> {
            self.net.drain(addr(2)).iter().map(|(_, d)| d[0]).collect()
        }
    }

    #[test]
    fn connect_side_retries_syn_until_timeout() {
        let mut rig = Rig::new();
        let settings = rig.settings.clone();
        let mut ch = KcpChannel::connect(5000, addr(2), 0);

        assert_eq!(ch.update(0, &settings, &mut rig.link()), Ok(Some(300)));
        assert_eq!(ch.update(100, &settings, &mut rig.link()), Ok(Some(300)));
        assert_eq!(ch.update(300, &settings, &mut rig.link()), Ok(Some(600)));
        assert_eq!(rig.sent(), vec![1, 1]);

        assert_eq!(ch.update(9_900, &settings, &mut rig.link()), Ok(Some(10_000)));
        assert_eq!(ch.update(10_000, &settings, &mut rig.link()), Err(ErrorCode::ConnectTimeout));
    }

    #[test]
    fn ack_establishes_and_flushes_queued_messages() {
        let mut rig = Rig::new();
        let settings = rig.settings.clone();
        let mut ch = KcpChannel::connect(5000, addr(2), 0);
        ch.send(b"early", &settings).unwrap();
        assert_eq!(ch.wait_snd(), 1);

        assert!(ch.on_ack(7000, &settings, &mut rig.link()).unwrap());
        assert_eq!(ch.state(), ChannelState::Established);
        assert_eq!(ch.remote_conn(), 7000);
        // Bare MSG announcing the connection.
        let frames = rig.net.drain(addr(2));
        assert_eq!(frames.len(), 1);
        assert_eq!(Frame::parse(&frames[0].1).unwrap(), Frame::Msg { sender: 5000, receiver: 7000, payload: &[] });

        ch.update(10, &settings, &mut rig.link()).unwrap();
        assert_eq!(rig.sent(), vec![4]);

        // A repeated ACK only repeats the bare MSG.
        assert!(!ch.on_ack(7000, &settings, &mut rig.link()).unwrap());
        assert_eq!(rig.sent(), vec![4]);
    }

    #[test]
    fn accept_side_resends_ack_and_times_out() {
        let mut rig = Rig::new();
        let settings = rig.settings.clone();
        let mut ch = KcpChannel::accept(7000, 5000, addr(2), 0, &settings).unwrap();
        assert_eq!(ch.update(0, &settings, &mut rig.link()), Ok(Some(500)));
        assert_eq!(ch.update(500, &settings, &mut rig.link()), Ok(Some(1_000)));
        assert_eq!(rig.sent(), vec![2, 2]);
        assert_eq!(ch.update(10_000, &settings, &mut rig.link()), Err(ErrorCode::AcceptTimeout));
    }

    #[test]
    fn first_msg_establishes_accept_side() {
        let settings = KcpSettings::default();
        let mut ch = KcpChannel::accept(7000, 5000, addr(2), 0, &settings).unwrap();
        let mut events = VecDeque::new();
        ch.on_msg(&[], &mut events).unwrap();
        assert_eq!(ch.state(), ChannelState::Established);
        assert!(events.is_empty());
        assert!(ch.on_msg(&[1, 2, 3], &mut events).is_err());
    }

    #[test]
    fn handshake_queue_is_bounded() {
        let settings = KcpSettings { send_window: 2, ..KcpSettings::default() };
        let mut ch = KcpChannel::connect(5000, addr(2), 0);
        for _ in 0..4 {
            ch.send(b"x", &settings).unwrap();
        }
        assert!(matches!(
            ch.send(b"x", &settings),
            Err(TransportError::Failed(ErrorCode::SendWindowOverflow))
        ));
    }

    #[test]
    fn close_sends_fins_only_when_the_peer_is_known() {
        let mut rig = Rig::new();
        let settings = rig.settings.clone();

        let mut ch = KcpChannel::connect(5000, addr(2), 0);
        ch.close(ErrorCode::LocalClose, true, &settings, &mut rig.link());
        assert_eq!(ch.state(), ChannelState::Disposed);
        assert!(rig.sent().is_empty());

        let mut ch = KcpChannel::accept(7000, 5000, addr(2), 0, &settings).unwrap();
        ch.close(ErrorCode::LocalClose, true, &settings, &mut rig.link());
        let frames = rig.net.drain(addr(2));
        assert_eq!(frames.len(), 4);
        assert_eq!(
            Frame::parse(&frames[0].1).unwrap(),
            Frame::Fin { sender: 7000, receiver: 5000, error: ErrorCode::LocalClose }
        );
        assert!(matches!(ch.send(b"late", &settings), Err(TransportError::ChannelClosed(_))));
    }
}
