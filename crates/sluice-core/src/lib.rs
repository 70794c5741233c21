pub mod buffer;
pub mod config;
pub mod framer;
pub mod kcp;
pub mod wire;
