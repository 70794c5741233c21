//! Sluice wire format: control frames and constants for the UDP transport
//! and the length prefix of the framed TCP transport.
//!
//! Every datagram on the UDP transport starts with a 1-byte tag. Control
//! frames (SYN, ACK, FIN) are fixed-size; MSG frames carry a 9-byte header
//! followed by one or more KCP segments. All integers are little-endian.
//!
//! "sender" is the connection id of the endpoint emitting a frame and
//! "receiver" the id of the endpoint it is addressed to. A receiver looks a
//! frame up by `receiver` and validates `sender` against the peer id it
//! learned during the handshake.
//!
//! Control frames are #[repr(C, packed)] and use zerocopy derives for
//! allocation-free serialization. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

type LeU32 = U32<LittleEndian>;

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Connect request.
pub const TAG_SYN: u8 = 1;
/// Accept / connect confirmation.
pub const TAG_ACK: u8 = 2;
/// Close, graceful or abrupt.
pub const TAG_FIN: u8 = 3;
/// Data: KCP segments.
pub const TAG_MSG: u8 = 4;

/// Minimum datagram length per tag. Shorter datagrams are dropped.
pub const SYN_LEN: usize = 5;
pub const ACK_LEN: usize = 9;
pub const FIN_LEN: usize = 13;
pub const MSG_HEADER_LEN: usize = 9;

/// Connection ids below this value are never allocated.
pub const MIN_CONN_ID: u32 = 1000;

/// Length of the framed-TCP packet prefix.
pub const PACKET_HEADER_LEN: usize = 4;

// ── Control frames ───────────────────────────────────────────────────────────

/// Connect request, sent by the connecting side until it sees an ACK.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SynFrame {
    pub tag: u8,
    pub sender: LeU32,
}

assert_eq_size!(SynFrame, [u8; SYN_LEN]);

/// Accept confirmation. Re-sent by the accepting side until the first MSG
/// arrives from the peer.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckFrame {
    pub tag: u8,
    pub sender: LeU32,
    pub receiver: LeU32,
}

assert_eq_size!(AckFrame, [u8; ACK_LEN]);

/// Close notification carrying the reason.
///
/// Wire size: 13 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FinFrame {
    pub tag: u8,
    pub sender: LeU32,
    pub receiver: LeU32,
    pub error: LeU32,
}

assert_eq_size!(FinFrame, [u8; FIN_LEN]);

/// Header preceding the KCP payload of a MSG datagram.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MsgHeader {
    pub tag: u8,
    pub sender: LeU32,
    pub receiver: LeU32,
}

assert_eq_size!(MsgHeader, [u8; MSG_HEADER_LEN]);

impl SynFrame {
    pub fn new(sender: u32) -> Self {
        Self { tag: TAG_SYN, sender: LeU32::new(sender) }
    }
}

impl AckFrame {
    pub fn new(sender: u32, receiver: u32) -> Self {
        Self { tag: TAG_ACK, sender: LeU32::new(sender), receiver: LeU32::new(receiver) }
    }
}

impl FinFrame {
    pub fn new(sender: u32, receiver: u32, error: ErrorCode) -> Self {
        Self {
            tag: TAG_FIN,
            sender: LeU32::new(sender),
            receiver: LeU32::new(receiver),
            error: LeU32::new(error.to_wire()),
        }
    }
}

impl MsgHeader {
    pub fn new(sender: u32, receiver: u32) -> Self {
        Self { tag: TAG_MSG, sender: LeU32::new(sender), receiver: LeU32::new(receiver) }
    }
}

/// Append a MSG header and payload to `out`.
pub fn encode_msg(out: &mut Vec<u8>, sender: u32, receiver: u32, payload: &[u8]) {
    out.extend_from_slice(MsgHeader::new(sender, receiver).as_bytes());
    out.extend_from_slice(payload);
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// A decoded UDP datagram. `Msg` borrows its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Syn { sender: u32 },
    Ack { sender: u32, receiver: u32 },
    Fin { sender: u32, receiver: u32, error: ErrorCode },
    Msg { sender: u32, receiver: u32, payload: &'a [u8] },
}

impl<'a> Frame<'a> {
    /// Decode a datagram. Trailing bytes after a fixed-size control frame
    /// are ignored.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, WireError> {
        let tag = *datagram.first().ok_or(WireError::Empty)?;
        let truncated = || WireError::Truncated { tag, len: datagram.len() };
        match tag {
            TAG_SYN => {
                let f = SynFrame::read_from_prefix(datagram).ok_or_else(truncated)?;
                Ok(Frame::Syn { sender: f.sender.get() })
            }
            TAG_ACK => {
                let f = AckFrame::read_from_prefix(datagram).ok_or_else(truncated)?;
                Ok(Frame::Ack { sender: f.sender.get(), receiver: f.receiver.get() })
            }
            TAG_FIN => {
                let f = FinFrame::read_from_prefix(datagram).ok_or_else(truncated)?;
                Ok(Frame::Fin {
                    sender: f.sender.get(),
                    receiver: f.receiver.get(),
                    error: ErrorCode::from_wire(f.error.get()),
                })
            }
            TAG_MSG => {
                let h = MsgHeader::read_from_prefix(datagram).ok_or_else(truncated)?;
                Ok(Frame::Msg {
                    sender: h.sender.get(),
                    receiver: h.receiver.get(),
                    payload: &datagram[MSG_HEADER_LEN..],
                })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

// ── Error codes ──────────────────────────────────────────────────────────────

/// Channel-level failure reason. Reported through the error callback and
/// carried in FIN frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    #[error("peer disconnected")]
    PeerDisconnect,
    #[error("no channel for connection id")]
    ChannelNotFound,
    #[error("connect handshake timed out")]
    ConnectTimeout,
    #[error("accept handshake timed out")]
    AcceptTimeout,
    #[error("send window overflow")]
    SendWindowOverflow,
    #[error("peer closed the stream")]
    PeerClosed,
    #[error("packet exceeds maximum size")]
    PacketTooLarge,
    #[error("peer unreachable")]
    PeerUnreachable,
    #[error("service disposed")]
    ServiceDisposed,
    #[error("socket error (os code {0})")]
    Socket(i32),
    #[error("closed locally")]
    LocalClose,
    #[error("unknown error code {0}")]
    Unknown(u32),
}

impl ErrorCode {
    /// Stable numeric value used in FIN frames. The OS code of a socket
    /// error does not travel.
    pub fn to_wire(self) -> u32 {
        match self {
            ErrorCode::PeerDisconnect => 1,
            ErrorCode::ChannelNotFound => 2,
            ErrorCode::ConnectTimeout => 3,
            ErrorCode::AcceptTimeout => 4,
            ErrorCode::SendWindowOverflow => 5,
            ErrorCode::PeerClosed => 6,
            ErrorCode::PacketTooLarge => 7,
            ErrorCode::PeerUnreachable => 8,
            ErrorCode::ServiceDisposed => 9,
            ErrorCode::Socket(_) => 10,
            ErrorCode::LocalClose => 11,
            ErrorCode::Unknown(v) => v,
        }
    }

    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => ErrorCode::PeerDisconnect,
            2 => ErrorCode::ChannelNotFound,
            3 => ErrorCode::ConnectTimeout,
            4 => ErrorCode::AcceptTimeout,
            5 => ErrorCode::SendWindowOverflow,
            6 => ErrorCode::PeerClosed,
            7 => ErrorCode::PacketTooLarge,
            8 => ErrorCode::PeerUnreachable,
            9 => ErrorCode::ServiceDisposed,
            10 => ErrorCode::Socket(0),
            11 => ErrorCode::LocalClose,
            other => ErrorCode::Unknown(other),
        }
    }

    /// Map a socket failure, keeping the platform error code when present.
    pub fn from_io(err: &std::io::Error) -> Self {
        ErrorCode::Socket(err.raw_os_error().unwrap_or(0))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("truncated frame: tag {tag}, {len} bytes")]
    Truncated { tag: u8, len: usize },
    #[error("unknown tag: {0:#04x}")]
    UnknownTag(u8),
}
