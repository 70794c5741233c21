use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use sluice_core::config::TcpSettings;
use sluice_core::wire::ErrorCode;

use super::channel::{TcpChannel, TcpState};
use crate::poller::Poller;
use crate::service::{ChannelId, ServiceEvent, Transport, TransportError};
use crate::socket::SocketHandle;
use crate::timer::{Clock, TimerWheel};

/// Length-prefixed packets over TCP, one channel per remote endpoint.
///
/// All channel state lives in a core that only the service's poller
/// touches; socket tasks reach it by posting closures.
pub struct TcpService {
    poller: Poller<TcpCore>,
    core: TcpCore,
}

struct TcpCore {
    sockets: SocketHandle<TcpCore>,
    channels: HashMap<ChannelId, TcpChannel>,
    by_address: HashMap<String, ChannelId>,
    timers: TimerWheel<ChannelId>,
    events: VecDeque<ServiceEvent>,
    clock: Clock,
    next_id: u64,
    settings: TcpSettings,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpService {
    pub fn new(settings: TcpSettings) -> Self {
        let poller = Poller::new();
        let core = TcpCore {
            sockets: SocketHandle::new(poller.handle()),
            channels: HashMap::new(),
            by_address: HashMap::new(),
            timers: TimerWheel::new(),
            events: VecDeque::new(),
            clock: Clock::new(),
            next_id: 1,
            settings,
            local_addr: None,
            accept_task: None,
        };
        Self { poller, core }
    }

    /// Start accepting on `addr`. Returns the bound address.
    pub async fn listen(&mut self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let task = self.core.sockets.listen(listener, TcpCore::on_accepted);
        if let Some(old) = self.core.accept_task.replace(task) {
            old.abort();
        }
        self.core.local_addr = Some(local);
        tracing::info!(addr = %local, "tcp service listening");
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// The channel for `addr`, connecting a new one if none exists.
    pub fn get_or_create(&mut self, addr: &str) -> ChannelId {
        if let Some(id) = self.core.by_address.get(addr) {
            return *id;
        }
        self.core.open(addr)
    }

    pub fn channel_count(&self) -> usize {
        self.core.channels.len()
    }

    pub fn remote(&self, channel: ChannelId) -> Option<&str> {
        self.core.channels.get(&channel).map(TcpChannel::remote)
    }

    pub fn is_connected(&self, channel: ChannelId) -> bool {
        self.core
            .channels
            .get(&channel)
            .map_or(false, |ch| ch.state() == TcpState::Connected)
    }

    /// Wait up to `timeout` for socket completions or the next flush, then
    /// run whatever is due.
    pub async fn poll(&mut self, timeout: Duration) {
        let wait = match self.core.timers.next_deadline() {
            Some(deadline) => {
                let now = self.core.clock.now_ms();
                Duration::from_millis(deadline.saturating_sub(now)).min(timeout)
            }
            None => timeout,
        };
        self.poller.wait(wait).await;
        self.tick();
    }
}

impl Transport for TcpService {
    fn connect(&mut self, addr: &str) -> Result<ChannelId, TransportError> {
        Ok(self.core.open(addr))
    }

    fn send(&mut self, channel: ChannelId, packet: &[u8]) -> Result<(), TransportError> {
        let ch = self
            .core
            .channels
            .get_mut(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        if ch.send(packet)? {
            self.core.schedule_flush(channel);
        }
        Ok(())
    }

    fn remove(&mut self, channel: ChannelId) -> bool {
        match self.core.detach(channel) {
            Some(ch) => {
                tracing::debug!(channel = %channel, remote = ch.remote(), "tcp channel removed");
                ch.shutdown();
                true
            }
            None => false,
        }
    }

    fn tick(&mut self) {
        self.poller.run_once(&mut self.core);
        self.core.run_timers();
    }

    fn poll_event(&mut self) -> Option<ServiceEvent> {
        self.core.events.pop_front()
    }
}

impl TcpCore {
    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    fn open(&mut self, addr: &str) -> ChannelId {
        let id = self.allocate_id();
        let channel = TcpChannel::new(addr.to_string(), self.settings.max_packet_size);
        self.channels.insert(id, channel);
        self.by_address.insert(addr.to_string(), id);
        tracing::debug!(channel = %id, remote = addr, "tcp connecting");
        self.sockets
            .connect(addr.to_string(), move |core: &mut TcpCore, result| core.on_connected(id, result));
        id
    }

    fn start(&self, id: ChannelId, stream: TcpStream) -> crate::socket::StreamSocket {
        self.sockets.start_stream(
            stream,
            move |core: &mut TcpCore, data| core.on_read(id, data),
            move |core: &mut TcpCore, e| core.on_socket_error(id, e),
        )
    }

    fn on_accepted(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "tcp accept failed");
                return;
            }
        };
        let id = self.allocate_id();
        let mut channel = TcpChannel::new(peer.to_string(), self.settings.max_packet_size);
        channel.attach(self.start(id, stream));
        self.channels.insert(id, channel);
        self.by_address.insert(peer.to_string(), id);
        self.events.push_back(ServiceEvent::Accepted { channel: id, remote: peer });
        tracing::info!(channel = %id, remote = %peer, "tcp channel accepted");
    }

    fn on_connected(&mut self, id: ChannelId, result: io::Result<TcpStream>) {
        if !self.channels.contains_key(&id) {
            // Removed while connecting; the stream just drops.
            return;
        }
        match result {
            Ok(stream) => {
                let socket = self.start(id, stream);
                if let Some(ch) = self.channels.get_mut(&id) {
                    ch.attach(socket);
                    tracing::info!(channel = %id, remote = ch.remote(), "tcp channel connected");
                }
            }
            Err(e) => {
                tracing::warn!(channel = %id, error = %e, "tcp connect failed");
                self.fail(id, ErrorCode::from_io(&e));
            }
        }
    }

    fn on_read(&mut self, id: ChannelId, data: Bytes) {
        if data.is_empty() {
            if self.channels.contains_key(&id) {
                tracing::debug!(channel = %id, "tcp peer closed");
                self.fail(id, ErrorCode::PeerClosed);
            }
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let events = &mut self.events;
        let result = ch.on_bytes(&data, |packet| {
            events.push_back(ServiceEvent::Received { channel: id, packet });
        });
        if let Err(e) = result {
            tracing::warn!(channel = %id, error = %e, "tcp framing failed");
            self.fail(id, ErrorCode::PacketTooLarge);
        }
    }

    fn on_socket_error(&mut self, id: ChannelId, e: io::Error) {
        if self.channels.contains_key(&id) {
            tracing::warn!(channel = %id, error = %e, "tcp socket error");
            self.fail(id, ErrorCode::from_io(&e));
        }
    }

    fn fail(&mut self, id: ChannelId, error: ErrorCode) {
        if let Some(ch) = self.detach(id) {
            ch.abort();
            self.events.push_back(ServiceEvent::Failed { channel: id, error });
        }
    }

    /// Drop `id` from every table and cancel its flush timer.
    fn detach(&mut self, id: ChannelId) -> Option<TcpChannel> {
        let ch = self.channels.remove(&id)?;
        if self.by_address.get(ch.remote()) == Some(&id) {
            self.by_address.remove(ch.remote());
        }
        self.timers.cancel(&id);
        Some(ch)
    }

    fn schedule_flush(&mut self, id: ChannelId) {
        let deadline = self.clock.now_ms() + self.settings.flush_interval_ms;
        self.timers.schedule(deadline, id);
    }

    fn run_timers(&mut self) {
        for id in self.timers.expire(self.clock.now_ms()) {
            let rearm = self.channels.get_mut(&id).map_or(false, TcpChannel::flush);
            if rearm {
                self.schedule_flush(id);
            }
        }
    }
}

impl Drop for TcpCore {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
