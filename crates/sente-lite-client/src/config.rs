//! Client configuration loading.
//!
//! TOML is the sole config source. All sections are optional in the TOML
//! and fall back to sane defaults; only `server.url` is required.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Bearer token sent as an `Authorization` header on connect, if set.
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub send_queue: crate::queue::SendQueueConfig,
    /// When true, non-system events are delivered to handlers wrapped as
    /// `chsk/recv` with data `[inner-id, inner-data]` instead of presented
    /// under their own event id. Default false.
    pub wrap_recv: bool,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(40),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    reconnect: Option<RawReconnectConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    send_queue: Option<RawSendQueueConfig>,
    wrap_recv: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReconnectConfig {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    ping_interval_ms: Option<u64>,
    pong_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSendQueueConfig {
    capacity: Option<usize>,
    send_timeout_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
}

/// Load client config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load client config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let server_url = raw_server
        .url
        .ok_or_else(|| ConfigError::MissingField("server.url".to_owned()))?;

    let reconnect = match raw.reconnect {
        Some(r) => {
            let defaults = ReconnectConfig::default();
            ReconnectConfig {
                initial_backoff: r
                    .initial_backoff_ms
                    .map_or(defaults.initial_backoff, Duration::from_millis),
                max_backoff: r
                    .max_backoff_ms
                    .map_or(defaults.max_backoff, Duration::from_millis),
                multiplier: r.multiplier.unwrap_or(defaults.multiplier),
            }
        }
        None => ReconnectConfig::default(),
    };

    let heartbeat = match raw.heartbeat {
        Some(h) => {
            let defaults = HeartbeatConfig::default();
            HeartbeatConfig {
                ping_interval: h
                    .ping_interval_ms
                    .map_or(defaults.ping_interval, Duration::from_millis),
                pong_timeout: h
                    .pong_timeout_ms
                    .map_or(defaults.pong_timeout, Duration::from_millis),
            }
        }
        None => HeartbeatConfig::default(),
    };

    let send_queue = match raw.send_queue {
        Some(q) => {
            let defaults = crate::queue::SendQueueConfig::default();
            crate::queue::SendQueueConfig {
                capacity: q.capacity.unwrap_or(defaults.capacity),
                default_timeout: q
                    .send_timeout_ms
                    .map(Duration::from_millis)
                    .or(defaults.default_timeout),
                flush_interval: q
                    .flush_interval_ms
                    .map_or(defaults.flush_interval, Duration::from_millis),
            }
        }
        None => crate::queue::SendQueueConfig::default(),
    };

    if reconnect.multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(
            "reconnect.multiplier must be >= 1.0".to_owned(),
        ));
    }

    Ok(ClientConfig {
        server_url,
        token: raw_server.token,
        reconnect,
        heartbeat,
        send_queue,
        wrap_recv: raw.wrap_recv.unwrap_or(false),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
