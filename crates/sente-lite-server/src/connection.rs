//! Per-connection WebSocket handler: upgrade, handshake send, and the
//! `tokio::select!`-driven read/write loop.

use std::sync::Mutex as StdMutex;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use sente_lite_wire::{chsk, decode, encode, sente_lite, EdnValue, Envelope, EventVector, Ident};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{ConnId, Connection, ServerState};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn kw(name: &str) -> EdnValue {
    EdnValue::Keyword(Ident::new(name))
}

fn map_of(pairs: Vec<(&str, EdnValue)>) -> EdnValue {
    EdnValue::Map(pairs.into_iter().map(|(k, v)| (kw(k), v)).collect())
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let conn_id: ConnId = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_CAPACITY);

    let conn = std::sync::Arc::new(Connection {
        id: conn_id,
        opened_at: Instant::now(),
        last_seen: StdMutex::new(Instant::now()),
        last_pong: StdMutex::new(Instant::now()),
        outbound: outbound_tx,
        subscriptions: StdMutex::new(Default::default()),
        closer: Notify::new(),
    });
    state.register_connection(std::sync::Arc::clone(&conn)).await;
    info!(%conn_id, "connection opened");

    let handshake_data = EdnValue::Vector(vec![
        EdnValue::Str(conn_id.to_string()),
        EdnValue::Nil,
        map_of(vec![("version", EdnValue::Str(env!("CARGO_PKG_VERSION").to_owned()))]),
        EdnValue::Bool(true),
    ]);
    let handshake = Envelope::fire_and_forget(EventVector::with_data(chsk::HANDSHAKE, handshake_data));
    if socket
        .send(Message::Text(encode(&handshake).into()))
        .await
        .is_err()
    {
        state.unregister_connection(conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            biased;
            () = conn.closer.notified() => {
                break;
            }
            msg = socket.recv() => {
                match msg {
                    None => break,
                    Some(Err(e)) => { warn!(%conn_id, error = %e, "websocket error"); break; }
                    Some(Ok(Message::Text(text))) => {
                        *conn.last_seen.lock().unwrap() = Instant::now();
                        handle_inbound_text(&state, &conn, &text, &mut socket).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        *conn.last_seen.lock().unwrap() = Instant::now();
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *conn.last_seen.lock().unwrap() = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    None => break,
                    Some(envelope) => {
                        let text = encode(&envelope);
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    state.unregister_connection(conn_id).await;
    info!(%conn_id, "connection closed");
}

async fn handle_inbound_text(state: &ServerState, conn: &Connection, text: &str, socket: &mut WebSocket) {
    let conn_id = conn.id;
    let envelope = match decode(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(%conn_id, error = %e, "routing malformed wire message as chsk/bad-event");
            let bad = Envelope::fire_and_forget(EventVector::with_data(
                chsk::BAD_EVENT,
                EdnValue::Str(text.to_owned()),
            ));
            state.dispatch(conn_id, &bad);
            return;
        }
    };

    match envelope.event.id.as_str() {
        chsk::WS_PING => {
            let pong = Envelope::fire_and_forget(EventVector::new(chsk::WS_PONG));
            let _ = socket.send(Message::Text(encode(&pong).into())).await;
        }
        chsk::WS_PONG => {
            *conn.last_pong.lock().unwrap() = Instant::now();
        }
        // Server-initiated only; a client sending its own handshake event
        // is simply ignored per the routing table.
        chsk::HANDSHAKE => {}
        sente_lite::SUBSCRIBE => {
            handle_subscribe(state, conn_id, &envelope.event, socket).await;
        }
        sente_lite::UNSUBSCRIBE => {
            handle_unsubscribe(state, conn_id, &envelope.event, socket).await;
        }
        sente_lite::PUBLISH => {
            handle_publish(state, conn_id, &envelope.event).await;
        }
        _ => {
            let handled = state.dispatch(conn_id, &envelope);
            if !handled {
                send_default_echo(conn_id, &envelope.event, socket).await;
            }
        }
    }
}

async fn handle_subscribe(state: &ServerState, conn_id: ConnId, event: &EventVector, socket: &mut WebSocket) {
    let Some(channel_id) = event.data.as_ref().and_then(|d| d.map_get("channel-id")).and_then(EdnValue::as_str) else {
        return;
    };
    let channel_id = channel_id.to_owned();

    let ack = match state.subscribe(&channel_id, conn_id).await {
        Ok(replay) => {
            let ack = Envelope::fire_and_forget(EventVector::with_data(
                sente_lite::SUBSCRIBED,
                map_of(vec![
                    ("channel-id", EdnValue::Str(channel_id.clone())),
                    ("success", EdnValue::Bool(true)),
                ]),
            ));
            let _ = socket.send(Message::Text(encode(&ack).into())).await;
            for replayed in replay {
                let wrapped = Envelope::fire_and_forget(EventVector::with_data(
                    sente_lite::CHANNEL_MSG,
                    map_of(vec![
                        ("channel-id", EdnValue::Str(channel_id.clone())),
                        ("data", replayed.data.unwrap_or(EdnValue::Nil)),
                        ("from", EdnValue::Nil),
                    ]),
                ));
                let _ = socket.send(Message::Text(encode(&wrapped).into())).await;
            }
            return;
        }
        Err(e) => Envelope::fire_and_forget(EventVector::with_data(
            sente_lite::SUBSCRIBED,
            map_of(vec![
                ("channel-id", EdnValue::Str(channel_id.clone())),
                ("success", EdnValue::Bool(false)),
                ("error", EdnValue::Str(e.to_string())),
            ]),
        )),
    };
    let _ = socket.send(Message::Text(encode(&ack).into())).await;
}

async fn handle_unsubscribe(state: &ServerState, conn_id: ConnId, event: &EventVector, socket: &mut WebSocket) {
    let Some(channel_id) = event.data.as_ref().and_then(|d| d.map_get("channel-id")).and_then(EdnValue::as_str) else {
        return;
    };
    let channel_id = channel_id.to_owned();

    let success = state.unsubscribe(&channel_id, conn_id).await.is_ok();
    let ack = Envelope::fire_and_forget(EventVector::with_data(
        sente_lite::SUBSCRIBED,
        map_of(vec![
            ("channel-id", EdnValue::Str(channel_id)),
            ("success", EdnValue::Bool(success)),
        ]),
    ));
    let _ = socket.send(Message::Text(encode(&ack).into())).await;
}

async fn handle_publish(state: &ServerState, conn_id: ConnId, event: &EventVector) {
    let Some(data) = &event.data else { return };
    let Some(channel_id) = data.map_get("channel-id").and_then(EdnValue::as_str) else {
        return;
    };
    let channel_id = channel_id.to_owned();
    let payload = data.map_get("data").cloned().unwrap_or(EdnValue::Nil);
    let exclude_sender = matches!(data.map_get("exclude-sender?"), Some(EdnValue::Bool(true)));

    let channel_msg = EventVector::with_data(
        sente_lite::CHANNEL_MSG,
        map_of(vec![
            ("channel-id", EdnValue::Str(channel_id.clone())),
            ("data", payload),
            ("from", EdnValue::Str(conn_id.to_string())),
        ]),
    );
    state
        .publish(&channel_id, channel_msg, exclude_sender.then_some(conn_id))
        .await;
}

async fn send_default_echo(conn_id: ConnId, event: &EventVector, socket: &mut WebSocket) {
    let timestamp_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let echo = Envelope::fire_and_forget(EventVector::with_data(
        sente_lite::ECHO,
        map_of(vec![
            ("original-event-id", EdnValue::Str(event.id.clone())),
            ("original-data", event.data.clone().unwrap_or(EdnValue::Nil)),
            ("conn-id", EdnValue::Str(conn_id.to_string())),
            ("timestamp", EdnValue::Int(timestamp_ms)),
        ]),
    ));
    let _ = socket.send(Message::Text(encode(&echo).into())).await;
}
