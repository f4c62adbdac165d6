//! Shared helpers for sente-lite's integration tests: bare WebSocket
//! clients that speak the wire protocol directly, bypassing
//! `sente-lite-client`.

pub mod raw_client;
pub mod silent_pong_client;

pub use raw_client::RawClient;
pub use silent_pong_client::SilentPongClient;
