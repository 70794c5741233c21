//! Framed TCP transport: `[u32 LE length][body]` packets over a stream.

mod channel;
mod service;

pub use channel::TcpState;
pub use service::TcpService;
