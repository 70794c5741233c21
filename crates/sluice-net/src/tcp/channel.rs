use bytes::Bytes;

use sluice_core::buffer::ChunkedBuffer;
use sluice_core::framer::{FramerError, PacketFramer};

use crate::socket::StreamSocket;

/// Chunk-sized writes handed to the socket per flush before yielding.
pub(crate) const MAX_WRITES_PER_FLUSH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Connecting,
    Connected,
}

/// One framed TCP connection. Owned and driven by its service.
#[derive(Debug)]
pub(crate) struct TcpChannel {
    remote: String,
    state: TcpState,
    socket: Option<StreamSocket>,
    send_buffer: ChunkedBuffer,
    recv_buffer: ChunkedBuffer,
    framer: PacketFramer,
    flush_scheduled: bool,
}

impl TcpChannel {
    pub fn new(remote: String, max_packet_size: usize) -> Self {
        Self {
            remote,
            state: TcpState::Connecting,
            socket: None,
            send_buffer: ChunkedBuffer::new(),
            recv_buffer: ChunkedBuffer::new(),
            framer: PacketFramer::new(max_packet_size),
            flush_scheduled: false,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn attach(&mut self, socket: StreamSocket) {
        self.socket = Some(socket);
        self.state = TcpState::Connected;
    }

    /// Bytes framed but not yet handed to the socket.
    pub fn queued(&self) -> usize {
        self.send_buffer.count()
    }

    /// Frame `packet` into the send buffer. Returns true when the caller
    /// must arm a flush timer.
    pub fn send(&mut self, packet: &[u8]) -> Result<bool, FramerError> {
        self.framer.encode_into(&mut self.send_buffer, packet)?;
        if self.flush_scheduled {
            return Ok(false);
        }
        self.flush_scheduled = true;
        Ok(true)
    }

    /// Hand buffered bytes to the socket. Returns true when the flush timer
    /// must fire again.
    pub fn flush(&mut self) -> bool {
        let Some(socket) = &self.socket else {
            // Still connecting: keep the timer alive while data waits.
            self.flush_scheduled = !self.send_buffer.is_empty();
            return self.flush_scheduled;
        };
        let chunk = self.send_buffer.chunk_size();
        for _ in 0..MAX_WRITES_PER_FLUSH {
            if self.send_buffer.is_empty() {
                break;
            }
            let n = self.send_buffer.count().min(chunk);
            socket.send(self.send_buffer.read(n));
        }
        self.flush_scheduled = !self.send_buffer.is_empty();
        self.flush_scheduled
    }

    /// Append received bytes and deliver every complete packet in order.
    pub fn on_bytes(&mut self, data: &[u8], mut deliver: impl FnMut(Bytes)) -> Result<(), FramerError> {
        self.recv_buffer.write(data);
        while self.framer.feed(&mut self.recv_buffer)? {
            if let Some(packet) = self.framer.take() {
                deliver(packet);
            }
        }
        Ok(())
    }

    /// Local close: push out whatever is still buffered, then let the
    /// writer finish and shut the stream down.
    pub fn shutdown(mut self) {
        if let Some(socket) = self.socket.take() {
            while !self.send_buffer.is_empty() {
                let n = self.send_buffer.count().min(self.send_buffer.chunk_size());
                socket.send(self.send_buffer.read(n));
            }
        }
    }

    /// Failure: drop both I/O tasks immediately.
    pub fn abort(mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }
}
