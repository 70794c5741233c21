//! Socket plumbing.
//!
//! Stream sockets run their I/O on tokio tasks and hand every completion
//! back to the owning [`Poller`](crate::poller::Poller) as a posted closure.
//! Datagram sockets are polled without blocking by their owner through the
//! [`DatagramSocket`] seam.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::poller::PollerHandle;

const READ_BUFFER: usize = 16 * 1024;

// ── Stream sockets ────────────────────────────────────────────────────────────

/// Starts socket operations whose completions run on a poller.
pub struct SocketHandle<C> {
    poller: PollerHandle<C>,
}

impl<C> Clone for SocketHandle<C> {
    fn clone(&self) -> Self {
        Self { poller: self.poller.clone() }
    }
}

impl<C: 'static> SocketHandle<C> {
    pub fn new(poller: PollerHandle<C>) -> Self {
        Self { poller }
    }

    /// Connect to `addr`; `done` runs on the poller with the outcome.
    pub fn connect<F>(&self, addr: String, done: F)
    where
        F: FnOnce(&mut C, io::Result<TcpStream>) + Send + 'static,
    {
        let poller = self.poller.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect(addr.as_str()).await;
            poller.post(move |ctx| done(ctx, result));
        });
    }

    /// Accept connections until the returned task is aborted. Each accept,
    /// or accept failure, is posted to `on_accept`.
    pub fn listen<F>(&self, listener: TcpListener, on_accept: F) -> JoinHandle<()>
    where
        F: Fn(&mut C, io::Result<(TcpStream, SocketAddr)>) + Send + Sync + 'static,
    {
        let poller = self.poller.clone();
        let on_accept = Arc::new(on_accept);
        tokio::spawn(async move {
            loop {
                let result = listener.accept().await;
                let cb = Arc::clone(&on_accept);
                if !poller.post(move |ctx| cb(ctx, result)) {
                    break;
                }
            }
        })
    }

    /// Start the read loop and the ordered writer for a connected stream.
    ///
    /// `on_read` receives each chunk read; an empty chunk means the peer
    /// closed its side. Read and write failures go to `on_error`.
    pub fn start_stream<R, E>(&self, stream: TcpStream, on_read: R, on_error: E) -> StreamSocket
    where
        R: Fn(&mut C, Bytes) + Send + Sync + 'static,
        E: Fn(&mut C, io::Error) + Send + Sync + 'static,
    {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "TCP_NODELAY failed");
        }
        let (mut read_half, mut write_half) = stream.into_split();
        let on_read = Arc::new(on_read);
        let on_error = Arc::new(on_error);

        let poller = self.poller.clone();
        let read_error = Arc::clone(&on_error);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_BUFFER);
            loop {
                buf.reserve(READ_BUFFER);
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        let cb = Arc::clone(&on_read);
                        poller.post(move |ctx| cb(ctx, Bytes::new()));
                        break;
                    }
                    Ok(_) => {
                        let data = buf.split().freeze();
                        let cb = Arc::clone(&on_read);
                        if !poller.post(move |ctx| cb(ctx, data)) {
                            break;
                        }
                    }
                    Err(e) => {
                        let cb = Arc::clone(&read_error);
                        poller.post(move |ctx| cb(ctx, e));
                        break;
                    }
                }
            }
        });

        let poller = self.poller.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    let cb = Arc::clone(&on_error);
                    poller.post(move |ctx| cb(ctx, e));
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        StreamSocket { peer, tx, reader, writer }
    }
}

/// A connected stream with its I/O tasks.
///
/// Dropping it stops the reader and lets already queued writes finish;
/// [`StreamSocket::close`] stops both at once.
#[derive(Debug)]
pub struct StreamSocket {
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamSocket {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue `data` behind earlier writes. False once the writer is gone.
    pub fn send(&self, data: Bytes) -> bool {
        self.tx.send(data).is_ok()
    }

    pub fn close(self) {
        self.writer.abort();
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ── Datagram sockets ──────────────────────────────────────────────────────────

/// Non-blocking datagram I/O. Both calls return `WouldBlock` instead of
/// waiting.
pub trait DatagramSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.try_recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a non-blocking UDP socket with enlarged kernel buffers.
///
/// Buffer sizes are best effort: the kernel may clamp them, and a refusal
/// is logged rather than returned. Must be called inside a tokio runtime.
pub fn bind_udp(addr: SocketAddr, buffer_bytes: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if buffer_bytes > 0 {
        if let Err(e) = socket.set_recv_buffer_size(buffer_bytes) {
            tracing::warn!(error = %e, bytes = buffer_bytes, "SO_RCVBUF refused");
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_bytes) {
            tracing::warn!(error = %e, bytes = buffer_bytes, "SO_SNDBUF refused");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
