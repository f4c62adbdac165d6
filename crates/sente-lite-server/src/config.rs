//! Server configuration loading. TOML is the sole config source; every
//! section is optional and falls back to the defaults below.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub heartbeat: HeartbeatConfig,
    pub channels: ChannelsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            heartbeat: HeartbeatConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the sweeper checks every connection's last-pong time.
    pub sweep_interval: Duration,
    /// A connection that hasn't sent a pong (or any traffic) within this
    /// window since the sweep started is evicted.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelsConfig {
    /// Create a channel on first subscribe/publish if it doesn't exist yet.
    pub auto_create: bool,
    pub max_subscribers_per_channel: usize,
    /// Number of recent messages retained per channel for replay-on-subscribe.
    /// `0` disables retention.
    pub retention_len: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            max_subscribers_per_channel: 10_000,
            retention_len: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    channels: Option<RawChannelsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    sweep_interval_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChannelsConfig {
    auto_create: Option<bool>,
    max_subscribers_per_channel: Option<usize>,
    retention_len: Option<usize>,
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ServerError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("reading '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ServerError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ServerError::Config(e.to_string()))?;
    let defaults = ServerConfig::default();

    let bind_addr = raw
        .server
        .and_then(|s| s.bind_addr)
        .unwrap_or(defaults.bind_addr);

    let heartbeat = match raw.heartbeat {
        Some(h) => HeartbeatConfig {
            sweep_interval: h
                .sweep_interval_ms
                .map_or(defaults.heartbeat.sweep_interval, Duration::from_millis),
            idle_timeout: h
                .idle_timeout_ms
                .map_or(defaults.heartbeat.idle_timeout, Duration::from_millis),
        },
        None => defaults.heartbeat,
    };

    let channels = match raw.channels {
        Some(c) => ChannelsConfig {
            auto_create: c.auto_create.unwrap_or(defaults.channels.auto_create),
            max_subscribers_per_channel: c
                .max_subscribers_per_channel
                .unwrap_or(defaults.channels.max_subscribers_per_channel),
            retention_len: c.retention_len.unwrap_or(defaults.channels.retention_len),
        },
        None => defaults.channels,
    };

    Ok(ServerConfig {
        bind_addr,
        heartbeat,
        channels,
    })
}
