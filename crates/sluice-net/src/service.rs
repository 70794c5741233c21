//! The surface collaborators program against.
//!
//! A service queues [`ServiceEvent`]s while it ticks; the application
//! drains them with [`Transport::poll_event`] or hands a
//! [`ServiceHandler`] to [`Transport::dispatch`]. Because events are only
//! delivered between ticks, handlers may call straight back into the
//! service.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;

use sluice_core::framer::FramerError;
use sluice_core::kcp::KcpError;
use sluice_core::wire::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A peer opened a channel to us.
    Accepted { channel: ChannelId, remote: SocketAddr },
    /// One complete packet, in send order.
    Received { channel: ChannelId, packet: Bytes },
    /// The channel is gone. No further events follow for it.
    Failed { channel: ChannelId, error: ErrorCode },
}

impl ServiceEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Accepted { channel, .. }
            | Self::Received { channel, .. }
            | Self::Failed { channel, .. } => *channel,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("channel {0} is closing")]
    ChannelClosed(ChannelId),
    #[error("no free connection id")]
    ConnIdExhausted,
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Framer(#[from] FramerError),
    #[error(transparent)]
    Kcp(#[from] KcpError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("channel failed: {0}")]
    Failed(ErrorCode),
}

/// Callbacks for service events. Every method defaults to doing nothing.
pub trait ServiceHandler {
    fn on_accept(&mut self, _transport: &mut dyn Transport, _channel: ChannelId, _remote: SocketAddr) {}

    fn on_receive(&mut self, _transport: &mut dyn Transport, _channel: ChannelId, _packet: Bytes) {}

    fn on_error(&mut self, _transport: &mut dyn Transport, _channel: ChannelId, _error: ErrorCode) {}
}

/// Operations shared by the framed-TCP and the UDP services.
pub trait Transport {
    /// Open a channel to `addr` ("host:port"). Sends are accepted at once
    /// and queued until the channel is up.
    fn connect(&mut self, addr: &str) -> Result<ChannelId, TransportError>;

    /// Queue one packet on `channel`.
    fn send(&mut self, channel: ChannelId, packet: &[u8]) -> Result<(), TransportError>;

    /// Close `channel` locally. No event is queued for it. Returns false if
    /// the channel was unknown.
    fn remove(&mut self, channel: ChannelId) -> bool;

    /// Run all work that is due now.
    fn tick(&mut self);

    fn poll_event(&mut self) -> Option<ServiceEvent>;

    /// Drain queued events into `handler`. Returns the number delivered.
    fn dispatch(&mut self, handler: &mut dyn ServiceHandler) -> usize
    where
        Self: Sized,
    {
        let mut delivered = 0;
        while let Some(event) = self.poll_event() {
            delivered += 1;
            match event {
                ServiceEvent::Accepted { channel, remote } => handler.on_accept(self, channel, remote),
                ServiceEvent::Received { channel, packet } => handler.on_receive(self, channel, packet),
                ServiceEvent::Failed { channel, error } => handler.on_error(self, channel, error),
            }
        }
        delivered
    }
}
