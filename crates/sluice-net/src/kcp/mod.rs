//! Reliable channels over UDP: a SYN/ACK/FIN/MSG handshake and connection
//! id multiplexing in front of one KCP engine per channel.

mod channel;
mod handshake;
mod service;

pub use channel::ChannelState;
pub use service::KcpService;
