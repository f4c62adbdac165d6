//! Client-side connection, send queue, and handler registry for
//! sente-lite: connects to a sente-lite server, maintains the reconnect
//! state machine, and exposes the send/handler API applications use.

pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod table;

pub use client::{Client, ConnectionState};
pub use config::{load_config_from_path, load_config_from_str, ClientConfig, ConfigError};
pub use error::ClientError;
pub use registry::HandlerId;
