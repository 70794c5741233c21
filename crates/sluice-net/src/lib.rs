pub mod kcp;
pub mod poller;
pub mod service;
#[cfg(test)]
pub(crate) mod simulator;
pub mod socket;
pub mod tcp;
pub mod timer;

pub use kcp::{ChannelState, KcpService};
pub use service::{ChannelId, ServiceEvent, ServiceHandler, Transport, TransportError};
pub use tcp::TcpService;
