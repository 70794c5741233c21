//! KCP conversations on top of the `kcp` crate's ARQ engine.
//!
//! The engine never touches a socket. It writes segments into an in-memory
//! outbox, and every call that can emit segments (`update`, `flush`) hands
//! them to a caller-supplied sink. Time is a caller-supplied millisecond
//! counter that may wrap.
//!
//! Message mode only: one `send` is delivered by exactly one `recv`.

use std::fmt;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};

use bytes::Bytes;

// ── Constants ────────────────────────────────────────────────────────────────

/// Segment header bytes in front of every payload.
pub const OVERHEAD: usize = 24;
/// The engine refuses messages needing 128 fragments or more.
const FRG_MAX: usize = 127;
const MTU_MIN: u32 = 50;
const RTO_MAX: i32 = 60_000;
const DEADLINK: u32 = 20;
const CMD_ACK: u8 = 82;

/// Signed distance between two wrapping millisecond or sequence counters.
#[inline]
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpConfig {
    /// Lower minimum RTO and gentler RTO backoff.
    pub nodelay: bool,
    /// Internal flush interval in ms, clamped to 10..=5000.
    pub interval: u32,
    /// Duplicate-ack count that triggers fast retransmit. 0 disables it.
    pub fast_resend: u32,
    /// Limit the send window by the congestion window.
    pub congestion_control: bool,
    pub send_window: u32,
    /// Never below 128, the largest fragment count a message may need.
    pub recv_window: u32,
    pub mtu: u32,
    /// Transmissions of one segment after which the link counts as dead.
    pub dead_link: u32,
}

impl Default for KcpConfig {
    /// Low-latency profile used by channels.
    fn default() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            fast_resend: 1,
            congestion_control: false,
            send_window: 256,
            recv_window: 256,
            mtu: 470,
            dead_link: DEADLINK,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum KcpError {
    #[error("mtu {0} is below the 50 byte minimum")]
    InvalidMtu(u32),
    #[error("truncated segment ({0} bytes)")]
    Truncated(usize),
    #[error("message of {len} bytes needs {count} fragments, limit is 127")]
    TooManyFragments { len: usize, count: usize },
    #[error("ack echoes timestamp {ts}, {elapsed} ms behind the local clock")]
    ImplausibleRtt { ts: u32, elapsed: u32 },
    #[error(transparent)]
    Engine(#[from] ::kcp::Error),
}

// ── Outbox ───────────────────────────────────────────────────────────────────

/// Engine output: each `write` is one datagram.
struct Outbox(Sender<Bytes>);

impl Write for Outbox {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // The receiving half lives next to the engine and outlives it.
        let _ = self.0.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// One KCP conversation. Owned by exactly one channel; not `Clone`.
pub struct Kcp {
    engine: ::kcp::Kcp<Outbox>,
    outbox: Receiver<Bytes>,
    conv: u32,
    mss: usize,
    /// Clock value of the last `update`.
    current: u32,
}

impl fmt::Debug for Kcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kcp")
            .field("conv", &self.conv)
            .field("mss", &self.mss)
            .field("current", &self.current)
            .field("wait_snd", &self.engine.wait_snd())
            .field("dead", &self.engine.is_dead_link())
            .finish()
    }
}

impl Kcp {
    pub fn new(conv: u32, config: &KcpConfig) -> Result<Self, KcpError> {
        let mss = Self::mss_for(config.mtu)?;
        let (tx, outbox) = mpsc::channel();
        let mut engine = ::kcp::Kcp::new(conv, Outbox(tx));
        engine.set_mtu(config.mtu as usize)?;
        engine.set_nodelay(
            config.nodelay,
            i32::try_from(config.interval).unwrap_or(i32::MAX),
            i32::try_from(config.fast_resend).unwrap_or(i32::MAX),
            !config.congestion_control,
        );
        engine.set_wndsize(window(config.send_window), window(config.recv_window));
        engine.set_maximum_resend_times(config.dead_link.max(1));
        Ok(Self { engine, outbox, conv, mss, current: 0 })
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn snd_wnd(&self) -> u32 {
        u32::from(self.engine.snd_wnd())
    }

    /// Segments queued or in flight and not yet acknowledged.
    pub fn wait_snd(&self) -> usize {
        self.engine.wait_snd()
    }

    /// Some segment reached `dead_link` transmissions without an ack.
    pub fn is_dead(&self) -> bool {
        self.engine.is_dead_link()
    }

    /// Fragment count a message of `len` bytes needs under `config`, or the
    /// error `send` would return for it.
    pub fn check_message(config: &KcpConfig, len: usize) -> Result<usize, KcpError> {
        let mss = Self::mss_for(config.mtu)?;
        Self::fragments(len, mss)
    }

    fn mss_for(mtu: u32) -> Result<usize, KcpError> {
        if mtu < MTU_MIN {
            return Err(KcpError::InvalidMtu(mtu));
        }
        Ok(mtu as usize - OVERHEAD)
    }

    fn fragments(len: usize, mss: usize) -> Result<usize, KcpError> {
        let count = if len <= mss { 1 } else { len.div_ceil(mss) };
        if count > FRG_MAX {
            return Err(KcpError::TooManyFragments { len, count });
        }
        Ok(count)
    }

    /// Queue one message. An empty message is delivered as an empty packet.
    pub fn send(&mut self, data: &[u8]) -> Result<(), KcpError> {
        Self::fragments(data.len(), self.mss)?;
        self.engine.send(data)?;
        Ok(())
    }

    /// Next complete message, if one has been reassembled.
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.engine.peeksize().ok()?;
        let mut buf = vec![0u8; size];
        let n = self.engine.recv(&mut buf).ok()?;
        buf.truncate(n);
        Some(Bytes::from(buf))
    }

    /// Feed one datagram of segments from the peer.
    pub fn input(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if data.len() < OVERHEAD {
            return Err(KcpError::Truncated(data.len()));
        }
        self.screen_acks(data)?;
        self.engine.input(data)?;
        Ok(())
    }

    /// Rejects a datagram whose acks echo a timestamp further back than any
    /// round trip the engine can time out on. The engine would otherwise
    /// fold that distance into its RTT estimate.
    fn screen_acks(&self, mut data: &[u8]) -> Result<(), KcpError> {
        while data.len() >= OVERHEAD {
            let cmd = data[4];
            let ts = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
            let len = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;
            if cmd == CMD_ACK {
                let elapsed = time_diff(self.current, ts);
                if elapsed > RTO_MAX {
                    return Err(KcpError::ImplausibleRtt { ts, elapsed: elapsed as u32 });
                }
            }
            data = data.get(OVERHEAD.saturating_add(len)..).unwrap_or_default();
        }
        Ok(())
    }

    /// Advance the clock to `current` and flush whatever is due into `output`.
    pub fn update<F: FnMut(&[u8])>(&mut self, current: u32, mut output: F) {
        self.current = current;
        // Outbox writes cannot fail, so the engine has nothing to report.
        let _ = self.engine.update(current);
        self.drain(&mut output);
    }

    /// Absolute time at which `update` should next run.
    pub fn check(&self, current: u32) -> u32 {
        self.engine.check(current)
    }

    /// Emit pending acks and data now instead of at the next interval.
    pub fn flush<F: FnMut(&[u8])>(&mut self, output: &mut F) {
        // Before the first update the engine declines to flush; nothing is lost.
        let _ = self.engine.flush();
        self.drain(output);
    }

    fn drain<F: FnMut(&[u8])>(&mut self, output: &mut F) {
        while let Ok(datagram) = self.outbox.try_recv() {
            output(&datagram);
        }
    }
}

fn window(size: u32) -> u16 {
    u16::try_from(size).unwrap_or(u16::MAX)
}
