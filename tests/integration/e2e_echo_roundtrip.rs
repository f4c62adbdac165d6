//! A client sends an event the server has no handler for; the server's
//! default `sente-lite/echo` fallback carries the original event-id and
//! data back to the sender, observable through the client's catch-all
//! handler.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_lite_client::config::{HeartbeatConfig, ReconnectConfig};
use sente_lite_client::{Client, ClientConfig};
use sente_lite_server::{start_server, ServerConfig};
use sente_lite_wire::{sente_lite, EdnValue, EventVector, Ident};

fn client_config(server_url: String) -> ClientConfig {
    ClientConfig {
        server_url,
        token: None,
        reconnect: ReconnectConfig::default(),
        heartbeat: HeartbeatConfig::default(),
        send_queue: sente_lite_client::queue::SendQueueConfig::default(),
        wrap_recv: false,
    }
}

#[tokio::test]
async fn unhandled_events_come_back_wrapped_as_the_default_echo() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let client = Client::connect(client_config(url));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let got_echo = Arc::new(AtomicBool::new(false));
    let original_data: Arc<Mutex<Option<EdnValue>>> = Arc::new(Mutex::new(None));
    let flag = Arc::clone(&got_echo);
    let data_slot = Arc::clone(&original_data);
    client.on(sente_lite::ECHO, move |event| {
        let Some(data) = &event.data else { return };
        if data.map_get("original-event-id").and_then(EdnValue::as_str) == Some("test/ping") {
            *data_slot.lock().unwrap() = data.map_get("original-data").cloned();
            flag.store(true, Ordering::SeqCst);
        }
    });

    client
        .send(
            EventVector::with_data(
                "test/ping",
                EdnValue::Map(vec![(EdnValue::Keyword(Ident::new("n")), EdnValue::Int(1))]),
            ),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(got_echo.load(Ordering::SeqCst));
    let data = original_data.lock().unwrap().clone().unwrap();
    assert_eq!(
        data.map_get("n"),
        Some(&EdnValue::Int(1)),
        "original-data should carry the request's own data back unchanged"
    );

    client.close();
    server.stop().await;
}
