//! A bare WebSocket client speaking the wire protocol directly, for tests
//! that need to drive a server without going through [`sente_lite_client`]
//! (e.g. to simulate a misbehaving peer).

use futures_util::{SinkExt, StreamExt};
use sente_lite_wire::{decode, encode, Envelope, EventVector};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RawClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl RawClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws.split();
        Ok(Self { write, read })
    }

    pub async fn send_event(&mut self, event: EventVector) -> Result<(), Box<dyn std::error::Error>> {
        let text = encode(&Envelope::fire_and_forget(event));
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Receive the next decoded event, silently replying to transport-level
    /// pings (matching every real client's behavior) but otherwise passing
    /// everything through undecoded-ping-aside.
    pub async fn recv_event(&mut self) -> Result<EventVector, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(decode(&text)?.event),
                Some(Ok(Message::Ping(data))) => {
                    self.write.send(Message::Pong(data)).await?;
                    continue;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by peer".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
