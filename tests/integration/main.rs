//! Sluice integration test harness.
//!
//! Every test runs both ends of a transport on loopback sockets inside
//! one runtime, so nothing here needs privileges or a prepared network:
//!
//!   cargo test --test integration
//!
//! Services bind port 0; tests never share sockets.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use sluice_core::config::SluiceConfig;
use sluice_core::wire::ErrorCode;
use sluice_net::{ChannelId, ChannelState, KcpService, ServiceEvent, ServiceHandler, TcpService, Transport};

// ── Harness ───────────────────────────────────────────────────────────────────

const STEP: Duration = Duration::from_millis(5);
const DEADLINE: Duration = Duration::from_secs(5);

/// Server-side handler: echo every packet, remember what happened.
#[derive(Default)]
struct Echo {
    accepted: Vec<ChannelId>,
    errors: Vec<(ChannelId, ErrorCode)>,
}

impl ServiceHandler for Echo {
    fn on_accept(&mut self, _transport: &mut dyn Transport, channel: ChannelId, _remote: SocketAddr) {
        self.accepted.push(channel);
    }

    fn on_receive(&mut self, transport: &mut dyn Transport, channel: ChannelId, packet: Bytes) {
        if let Err(e) = transport.send(channel, &packet) {
            panic!("echo on {channel} failed: {e}");
        }
    }

    fn on_error(&mut self, _transport: &mut dyn Transport, channel: ChannelId, error: ErrorCode) {
        self.errors.push((channel, error));
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn kcp_service() -> Result<KcpService<UdpSocket>> {
    let config = SluiceConfig::default();
    KcpService::bind(loopback(), config.kcp, 1 << 20).context("failed to bind kcp service")
}

/// Drive a KCP server (through `echo`) and client until `done` holds for
/// the client's events.
async fn pump_kcp(
    server: &mut KcpService<UdpSocket>,
    client: &mut KcpService<UdpSocket>,
    echo: &mut Echo,
    events: &mut Vec<ServiceEvent>,
    done: impl Fn(&[ServiceEvent], &Echo) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        server.poll(STEP).await;
        server.dispatch(echo);
        client.poll(STEP).await;
        while let Some(event) = client.poll_event() {
            events.push(event);
        }
        if done(events, echo) {
            return Ok(());
        }
    }
    bail!("condition not reached; client events: {events:?}")
}

async fn pump_tcp(
    server: &mut TcpService,
    client: &mut TcpService,
    echo: &mut Echo,
    events: &mut Vec<ServiceEvent>,
    done: impl Fn(&[ServiceEvent], &Echo) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        server.poll(STEP).await;
        server.dispatch(echo);
        client.poll(STEP).await;
        while let Some(event) = client.poll_event() {
            events.push(event);
        }
        if done(events, echo) {
            return Ok(());
        }
    }
    bail!("condition not reached; client events: {events:?}")
}

fn received_on(events: &[ServiceEvent], channel: ChannelId) -> Vec<Bytes> {
    events
        .iter()
        .filter_map(|e| match e {
            ServiceEvent::Received { channel: c, packet } if *c == channel => Some(packet.clone()),
            _ => None,
        })
        .collect()
}

// ── KCP over UDP ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn kcp_echo_over_loopback() -> Result<()> {
    let mut server = kcp_service()?;
    let mut client = kcp_service()?;
    let mut echo = Echo::default();

    let channel = client.connect(&server.local_addr().to_string())?;
    let large: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    client.send(channel, b"hello")?;
    client.send(channel, &large)?;
    client.send(channel, b"")?;

    let mut events = Vec::new();
    pump_kcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| received_on(ev, channel).len() == 3).await?;

    let got = received_on(&events, channel);
    assert_eq!(&got[0][..], b"hello");
    assert_eq!(&got[1][..], &large[..]);
    assert!(got[2].is_empty());
    assert_eq!(echo.accepted.len(), 1);
    assert_eq!(client.state(channel), Some(ChannelState::Established));
    Ok(())
}

#[tokio::test]
async fn kcp_channels_stay_separate() -> Result<()> {
    let mut server = kcp_service()?;
    let mut client = kcp_service()?;
    let mut echo = Echo::default();
    let target = server.local_addr().to_string();

    let mut channels = Vec::new();
    for i in 0..8u8 {
        let channel = client.connect(&target)?;
        client.send(channel, &[i; 32])?;
        channels.push(channel);
    }

    let mut events = Vec::new();
    pump_kcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| {
        channels.iter().all(|ch| !received_on(ev, *ch).is_empty())
    })
    .await?;

    for (i, channel) in channels.iter().enumerate() {
        assert_eq!(received_on(&events, *channel), vec![Bytes::from(vec![i as u8; 32])]);
    }
    assert_eq!(echo.accepted.len(), 8);
    assert_eq!(server.channel_count(), 8);
    Ok(())
}

#[tokio::test]
async fn kcp_local_remove_disconnects_the_peer() -> Result<()> {
    let mut server = kcp_service()?;
    let mut client = kcp_service()?;
    let mut echo = Echo::default();

    let channel = client.connect(&server.local_addr().to_string())?;
    client.send(channel, b"ping")?;
    let mut events = Vec::new();
    pump_kcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| !received_on(ev, channel).is_empty()).await?;

    assert!(client.remove(channel));
    assert!(!client.remove(channel));
    pump_kcp(&mut server, &mut client, &mut echo, &mut events, |_, echo| !echo.errors.is_empty()).await?;

    assert_eq!(echo.errors, vec![(echo.accepted[0], ErrorCode::PeerDisconnect)]);
    assert_eq!(server.channel_count(), 0);
    // A local remove is silent on the side that asked for it.
    assert!(events.iter().all(|e| !matches!(e, ServiceEvent::Failed { .. })));
    Ok(())
}

#[tokio::test]
async fn kcp_shutdown_fails_every_channel() -> Result<()> {
    let mut server = kcp_service()?;
    let mut client = kcp_service()?;
    let mut echo = Echo::default();
    let target = server.local_addr().to_string();

    let first = client.connect(&target)?;
    let second = client.connect(&target)?;
    client.send(first, b"a")?;
    client.send(second, b"b")?;
    let mut events = Vec::new();
    pump_kcp(&mut server, &mut client, &mut echo, &mut events, |_, echo| echo.accepted.len() == 2).await?;

    events.clear();
    client.shutdown();
    while let Some(event) = client.poll_event() {
        events.push(event);
    }
    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServiceEvent::Failed { channel, error } => Some((*channel, *error)),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|(_, error)| *error == ErrorCode::ServiceDisposed));
    assert_eq!(client.channel_count(), 0);

    // The FINs it sent take the server side down too.
    let mut idle = Vec::new();
    pump_kcp(&mut server, &mut client, &mut echo, &mut idle, |_, echo| echo.errors.len() == 2).await?;
    assert!(echo.errors.iter().all(|(_, error)| *error == ErrorCode::PeerDisconnect));
    Ok(())
}

#[tokio::test]
async fn kcp_connect_to_silent_port_times_out() -> Result<()> {
    let mut settings = SluiceConfig::default().kcp;
    settings.handshake_timeout_ms = 300;
    let mut client = KcpService::bind(loopback(), settings, 1 << 20)?;
    // Bound but never polled, so nothing ever answers the SYNs.
    let silent = std::net::UdpSocket::bind(loopback())?;

    let channel = client.connect(&silent.local_addr()?.to_string())?;
    let deadline = Instant::now() + DEADLINE;
    loop {
        client.poll(STEP).await;
        if let Some(event) = client.poll_event() {
            assert_eq!(event, ServiceEvent::Failed { channel, error: ErrorCode::ConnectTimeout });
            break;
        }
        if Instant::now() >= deadline {
            bail!("connect never timed out");
        }
    }
    assert_eq!(client.channel_count(), 0);
    Ok(())
}

// ── Framed TCP ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tcp_echo_preserves_packet_boundaries() -> Result<()> {
    let config = SluiceConfig::default();
    let mut server = TcpService::new(config.tcp.clone());
    let addr = server.listen("127.0.0.1:0").await?;
    let mut client = TcpService::new(config.tcp);
    let mut echo = Echo::default();

    let channel = client.get_or_create(&addr.to_string());
    let packets: Vec<Vec<u8>> = (0..50usize).map(|i| vec![i as u8; i * 97]).collect();
    for packet in &packets {
        client.send(channel, packet)?;
    }

    let mut events = Vec::new();
    pump_tcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| received_on(ev, channel).len() == packets.len())
        .await?;

    let got = received_on(&events, channel);
    for (sent, echoed) in packets.iter().zip(&got) {
        assert_eq!(&sent[..], &echoed[..]);
    }
    assert_eq!(echo.accepted.len(), 1);
    Ok(())
}

#[tokio::test]
async fn tcp_server_close_reaches_the_client() -> Result<()> {
    let config = SluiceConfig::default();
    let mut server = TcpService::new(config.tcp.clone());
    let addr = server.listen("127.0.0.1:0").await?;
    let mut client = TcpService::new(config.tcp);
    let mut echo = Echo::default();

    let channel = client.get_or_create(&addr.to_string());
    client.send(channel, b"last words")?;
    let mut events = Vec::new();
    pump_tcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| !received_on(ev, channel).is_empty()).await?;

    let accepted = echo.accepted[0];
    assert!(server.remove(accepted));
    pump_tcp(&mut server, &mut client, &mut echo, &mut events, |ev, _| {
        ev.iter().any(|e| matches!(e, ServiceEvent::Failed { .. }))
    })
    .await?;

    assert!(events.contains(&ServiceEvent::Failed { channel, error: ErrorCode::PeerClosed }));
    assert_eq!(client.channel_count(), 0);
    assert!(echo.errors.is_empty());
    Ok(())
}

// ── Config ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn config_file_drives_both_services() -> Result<()> {
    let path = std::env::temp_dir().join(format!("sluice-it-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        "[network]\nkcp_bind = \"127.0.0.1:0\"\n\n[kcp]\nmtu = 1200\nsend_window = 64\n\n[tcp]\nmax_packet_size = 4096\n",
    )?;
    let config = SluiceConfig::from_file(&path);
    std::fs::remove_file(&path)?;
    let config = config?;

    assert_eq!(config.kcp.mtu, 1200);
    assert_eq!(config.kcp.send_window, 64);
    assert_eq!(config.kcp.fin_repeat, 4);

    let kcp = KcpService::bind(config.network.kcp_bind.parse()?, config.kcp.clone(), 1 << 20)?;
    assert_eq!(kcp.settings().mtu, 1200);

    let mut server = TcpService::new(config.tcp.clone());
    let addr = server.listen("127.0.0.1:0").await?;
    let mut client = TcpService::new(config.tcp);
    let channel = client.get_or_create(&addr.to_string());
    assert!(client.send(channel, &[0u8; 8192]).is_err());
    Ok(())
}
