//! Client-side error type.

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("wire decode error: {0}")]
    Decode(#[from] sente_lite_wire::DecodeError),
    #[error("send queue is full")]
    QueueFull,
    #[error("send timed out")]
    Timeout,
    #[error("not connected")]
    Disconnected,
    #[error("handler with id {0:?} not found")]
    UnknownHandler(crate::registry::HandlerId),
    #[error("config error: {0}")]
    Config(String),
}
