//! Configuration system for Sluice.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SLUICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sluice/config.toml
//!   3. ~/.config/sluice/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::framer::DEFAULT_MAX_PACKET_SIZE;
use crate::kcp::KcpConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub network: NetworkConfig,
    pub kcp: KcpSettings,
    pub tcp: TcpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the KCP service binds.
    pub kcp_bind: String,
    /// TCP address the framed-TCP service listens on.
    pub tcp_bind: String,
    /// SO_SNDBUF / SO_RCVBUF for the shared UDP socket.
    pub socket_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpSettings {
    pub nodelay: bool,
    pub interval_ms: u32,
    pub fast_resend: u32,
    pub send_window: u32,
    pub recv_window: u32,
    pub mtu: u32,
    pub congestion_control: bool,
    /// SYN retry period while connecting.
    pub connect_retry_ms: u64,
    /// ACK retry period while waiting for the first message.
    pub accept_retry_ms: u64,
    /// Absolute cap on a handshake, either side.
    pub handshake_timeout_ms: u64,
    /// FIN copies sent on teardown.
    pub fin_repeat: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Delay between a send and the flush that writes it out.
    pub flush_interval_ms: u64,
    /// Largest accepted packet body.
    pub max_packet_size: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            kcp_bind: "0.0.0.0:7400".to_string(),
            tcp_bind: "0.0.0.0:7401".to_string(),
            socket_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for KcpSettings {
    fn default() -> Self {
        let engine = KcpConfig::default();
        Self {
            nodelay: engine.nodelay,
            interval_ms: engine.interval,
            fast_resend: engine.fast_resend,
            send_window: engine.send_window,
            recv_window: engine.recv_window,
            mtu: engine.mtu,
            congestion_control: engine.congestion_control,
            connect_retry_ms: 300,
            accept_retry_ms: 500,
            handshake_timeout_ms: 10_000,
            fin_repeat: 4,
        }
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl KcpSettings {
    /// Engine parameters for a new channel.
    pub fn engine(&self) -> KcpConfig {
        KcpConfig {
            nodelay: self.nodelay,
            interval: self.interval_ms,
            fast_resend: self.fast_resend,
            congestion_control: self.congestion_control,
            send_window: self.send_window,
            recv_window: self.recv_window,
            mtu: self.mtu,
            ..KcpConfig::default()
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sluice")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SluiceConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SLUICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SLUICE_NETWORK__KCP_BIND") {
            self.network.kcp_bind = v;
        }
        if let Some(v) = var("SLUICE_NETWORK__TCP_BIND") {
            self.network.tcp_bind = v;
        }
        if let Some(v) = var("SLUICE_KCP__MTU").and_then(|v| v.parse().ok()) {
            self.kcp.mtu = v;
        }
        if let Some(v) = var("SLUICE_KCP__INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.kcp.interval_ms = v;
        }
        if let Some(v) = var("SLUICE_TCP__FLUSH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.tcp.flush_interval_ms = v;
        }
    }
}
