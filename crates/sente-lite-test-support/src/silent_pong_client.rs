//! A client stub that completes the handshake like any other connection
//! but never answers `chsk/ws-ping` — used to exercise the server's
//! heartbeat eviction path deterministically.

use futures_util::StreamExt;
use sente_lite_wire::decode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects and reads the handshake, then simply holds the socket open
/// without ever replying to pings or sending traffic of its own.
pub struct SilentPongClient {
    _read: futures_util::stream::SplitStream<WsStream>,
    _write: futures_util::stream::SplitSink<WsStream, Message>,
}

impl SilentPongClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, mut read) = ws.split();

        // Drain the handshake event so the socket isn't left with an
        // unread frame sitting in the OS buffer.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let _ = decode(&text);
                    break;
                }
                Some(Ok(_)) => continue,
                _ => break,
            }
        }

        Ok(Self {
            _read: read,
            _write: write,
        })
    }
}
