//! Length-prefixed packet extraction over a [`ChunkedBuffer`].
//!
//! Wire format: `[u32 LE body length][body]`, repeated. `feed` may be called
//! whenever convenient; it only advances when the buffer holds enough bytes
//! for the current state.

use bytes::Bytes;

use crate::buffer::ChunkedBuffer;
use crate::wire::PACKET_HEADER_LEN;

/// Default cap on a single packet body.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    AwaitingLength,
    AwaitingBody(usize),
}

#[derive(Debug)]
pub struct PacketFramer {
    state: ParserState,
    max_packet_size: usize,
    ready: Option<Bytes>,
}

impl PacketFramer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            state: ParserState::AwaitingLength,
            max_packet_size,
            ready: None,
        }
    }

    /// Advance as far as `buf` allows. Returns true when a packet is ready
    /// for [`take`](Self::take). Nothing more is consumed until it is taken.
    pub fn feed(&mut self, buf: &mut ChunkedBuffer) -> Result<bool, FramerError> {
        if self.ready.is_some() {
            return Ok(true);
        }
        loop {
            match self.state {
                ParserState::AwaitingLength => {
                    if buf.count() < PACKET_HEADER_LEN {
                        return Ok(false);
                    }
                    let mut header = [0u8; PACKET_HEADER_LEN];
                    buf.read_into(&mut header);
                    let len = u32::from_le_bytes(header) as usize;
                    if len > self.max_packet_size {
                        return Err(FramerError::PacketTooLarge { len, max: self.max_packet_size });
                    }
                    self.state = ParserState::AwaitingBody(len);
                }
                ParserState::AwaitingBody(len) => {
                    if buf.count() < len {
                        return Ok(false);
                    }
                    let body = if len == 0 { Bytes::new() } else { buf.read(len) };
                    self.ready = Some(body);
                    return Ok(true);
                }
            }
        }
    }

    /// Hand out the completed packet and go back to reading a length.
    pub fn take(&mut self) -> Option<Bytes> {
        let packet = self.ready.take()?;
        self.state = ParserState::AwaitingLength;
        Some(packet)
    }

    pub fn encode_header(len: usize) -> Result<[u8; PACKET_HEADER_LEN], FramerError> {
        let len32 = u32::try_from(len).map_err(|_| FramerError::PacketTooLarge {
            len,
            max: u32::MAX as usize,
        })?;
        Ok(len32.to_le_bytes())
    }

    /// Write one framed packet into `buf`.
    pub fn encode_into(&self, buf: &mut ChunkedBuffer, body: &[u8]) -> Result<(), FramerError> {
        if body.len() > self.max_packet_size {
            return Err(FramerError::PacketTooLarge { len: body.len(), max: self.max_packet_size });
        }
        buf.write(&Self::encode_header(body.len())?);
        buf.write(body);
        Ok(())
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge { len: usize, max: usize },
}
