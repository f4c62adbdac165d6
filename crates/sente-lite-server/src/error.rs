//! Server-side error type.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(String),
    #[error("server is not running")]
    NotRunning,
    #[error("channel {0:?} not found")]
    UnknownChannel(String),
    #[error("channel {0:?} is at its subscriber limit")]
    ChannelFull(String),
    #[error("connection {0:?} not found")]
    UnknownConnection(uuid::Uuid),
    #[error("send queue is full")]
    QueueFull,
    #[error("config error: {0}")]
    Config(String),
}
