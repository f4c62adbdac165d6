//! Small HTTP introspection surface served alongside the WebSocket route:
//! `/health`, `/stats`, `/channels`.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::ServerState;

pub async fn health() -> impl IntoResponse {
    "ok"
}

#[derive(Serialize)]
struct StatsResponse {
    connections_open: u64,
    connections_opened: u64,
    connections_closed: u64,
    events_received: u64,
    events_sent: u64,
    channel_count: usize,
}

pub async fn stats(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.stats().await;
    Json(StatsResponse {
        connections_open: stats.connections_open,
        connections_opened: stats.connections_opened,
        connections_closed: stats.connections_closed,
        events_received: stats.events_received,
        events_sent: stats.events_sent,
        channel_count: stats.channel_count,
    })
}

#[derive(Serialize)]
struct ChannelsResponse {
    channels: Vec<String>,
}

pub async fn channels(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ChannelsResponse {
        channels: state.channel_names().await,
    })
}
