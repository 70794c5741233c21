//! sluiced: echo daemon and probe client for the sluice transports.
//!
//!   sluiced                         serve KCP and framed TCP, echoing packets
//!   sluiced probe <addr> <message>  send one message over KCP, print the echo
//!   sluiced probe --tcp <addr> <message>

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use sluice_core::config::SluiceConfig;
use sluice_core::wire::ErrorCode;
use sluice_net::{ChannelId, KcpService, ServiceEvent, ServiceHandler, TcpService, Transport};

/// Longest single wait inside the serve loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SluiceConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SluiceConfig::load().context("failed to load config")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["serve"] => serve(config).await,
        ["probe", "--tcp", addr, message] => probe_tcp(config, addr, message).await,
        ["probe", addr, message] => probe_kcp(config, addr, message).await,
        _ => bail!("usage: sluiced [serve] | sluiced probe [--tcp] <addr> <message>"),
    }
}

// ── Serve ─────────────────────────────────────────────────────────────────────

/// Sends every received packet back on the channel it came from.
#[derive(Default)]
struct Echo {
    accepted: u64,
    echoed: u64,
}

impl ServiceHandler for Echo {
    fn on_accept(&mut self, _transport: &mut dyn Transport, channel: ChannelId, remote: SocketAddr) {
        self.accepted += 1;
        tracing::info!(%channel, %remote, "channel accepted");
    }

    fn on_receive(&mut self, transport: &mut dyn Transport, channel: ChannelId, packet: Bytes) {
        match transport.send(channel, &packet) {
            Ok(()) => self.echoed += 1,
            Err(e) => tracing::warn!(%channel, error = %e, "echo failed"),
        }
    }

    fn on_error(&mut self, _transport: &mut dyn Transport, channel: ChannelId, error: ErrorCode) {
        tracing::info!(%channel, %error, "channel closed");
    }
}

async fn serve(config: SluiceConfig) -> Result<()> {
    let kcp_addr: SocketAddr = config
        .network
        .kcp_bind
        .parse()
        .with_context(|| format!("invalid kcp bind address {:?}", config.network.kcp_bind))?;
    let mut kcp = KcpService::bind(kcp_addr, config.kcp.clone(), config.network.socket_buffer_bytes)
        .context("failed to bind kcp service")?;

    let mut tcp = TcpService::new(config.tcp.clone());
    let tcp_addr = tcp
        .listen(&config.network.tcp_bind)
        .await
        .context("failed to listen for tcp")?;
    tracing::info!(kcp = %kcp.local_addr(), tcp = %tcp_addr, "sluiced serving");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut echo = Echo::default();
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = kcp.poll(POLL_INTERVAL) => {}
            _ = tcp.poll(POLL_INTERVAL) => {}
        }
        // Whichever poll lost the race was cancelled before it ticked.
        kcp.tick();
        tcp.tick();
        kcp.dispatch(&mut echo);
        tcp.dispatch(&mut echo);
    }

    tracing::info!(
        kcp_channels = kcp.channel_count(),
        tcp_channels = tcp.channel_count(),
        accepted = echo.accepted,
        echoed = echo.echoed,
        "shutting down"
    );
    kcp.shutdown();
    kcp.dispatch(&mut echo);
    Ok(())
}

// ── Probe ─────────────────────────────────────────────────────────────────────

async fn probe_kcp(config: SluiceConfig, addr: &str, message: &str) -> Result<()> {
    let target: SocketAddr = addr.parse().with_context(|| format!("invalid address {addr:?}"))?;
    let local = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let mut kcp = KcpService::bind(local, config.kcp.clone(), config.network.socket_buffer_bytes)
        .context("failed to bind kcp service")?;

    let channel = kcp.connect(addr)?;
    kcp.send(channel, message.as_bytes())?;
    let started = Instant::now();
    let deadline = started + PROBE_TIMEOUT;
    loop {
        if let Some(reply) = take_reply(&mut kcp, channel)? {
            report(&reply, started);
            kcp.remove(channel);
            return Ok(());
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bail!("no reply from {addr} within {PROBE_TIMEOUT:?}");
        }
        kcp.poll(left.min(POLL_INTERVAL)).await;
    }
}

async fn probe_tcp(config: SluiceConfig, addr: &str, message: &str) -> Result<()> {
    let mut tcp = TcpService::new(config.tcp.clone());
    let channel = tcp.get_or_create(addr);
    tcp.send(channel, message.as_bytes())?;
    let started = Instant::now();
    let deadline = started + PROBE_TIMEOUT;
    loop {
        if let Some(reply) = take_reply(&mut tcp, channel)? {
            report(&reply, started);
            tcp.remove(channel);
            return Ok(());
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bail!("no reply from {addr} within {PROBE_TIMEOUT:?}");
        }
        tcp.poll(left.min(POLL_INTERVAL)).await;
    }
}

/// First packet received on `channel`, or the error that closed it.
fn take_reply(transport: &mut impl Transport, channel: ChannelId) -> Result<Option<Bytes>> {
    while let Some(event) = transport.poll_event() {
        match event {
            ServiceEvent::Received { channel: from, packet } if from == channel => return Ok(Some(packet)),
            ServiceEvent::Failed { channel: from, error } if from == channel => {
                bail!("channel {channel} failed: {error}")
            }
            other => tracing::debug!(channel = %other.channel(), "ignoring event"),
        }
    }
    Ok(None)
}

fn report(reply: &[u8], started: Instant) {
    tracing::info!(rtt_ms = started.elapsed().as_millis() as u64, bytes = reply.len(), "reply received");
    println!("{}", String::from_utf8_lossy(reply));
}
