//! WebSocket accept loop, channel pub/sub, heartbeat sweeper, and HTTP
//! introspection for sente-lite servers.

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod server;
pub mod state;

pub use config::{load_config_from_path, load_config_from_str, ChannelsConfig, HeartbeatConfig, ServerConfig};
pub use error::ServerError;
pub use server::{shutdown_signal, start_server, ServerHandle};
pub use state::{ConnId, ServerState, ServerStats};
