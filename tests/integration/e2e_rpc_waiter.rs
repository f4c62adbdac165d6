//! A `take_predicate` waiter matches on `data.request-id`, correlating
//! against the `request-id` the server's default echo reply carries back
//! under `original-data`. A second waiter with nothing sent for it instead
//! observes a synthesized timeout event.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_lite_client::config::{HeartbeatConfig, ReconnectConfig};
use sente_lite_client::{Client, ClientConfig};
use sente_lite_server::{start_server, ServerConfig};
use sente_lite_wire::{EdnValue, EventVector, Ident};

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

fn query(request_id: &str) -> EventVector {
    EventVector::with_data(
        "app/query",
        EdnValue::Map(vec![(
            EdnValue::Keyword(Ident::new("request-id")),
            EdnValue::Str(request_id.to_owned()),
        )]),
    )
}

fn echoed_request_id(event: &EventVector) -> Option<String> {
    event
        .data
        .as_ref()?
        .map_get("original-data")?
        .map_get("request-id")?
        .as_str()
        .map(str::to_owned)
}

#[tokio::test]
async fn rpc_waiter_resolves_against_the_default_echo_and_times_out_for_unsent_requests() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let client = Client::connect(client_config(url));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let r1_reply: Arc<Mutex<Option<EventVector>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&r1_reply);
    client.take_predicate(
        |event| echoed_request_id(event).as_deref() == Some("r1"),
        Some(Duration::from_millis(500)),
        move |event| *slot.lock().unwrap() = Some(event.clone()),
    );

    let r2_reply: Arc<Mutex<Option<EventVector>>> = Arc::new(Mutex::new(None));
    let slot2 = Arc::clone(&r2_reply);
    client.take_predicate(
        |event| echoed_request_id(event).as_deref() == Some("r2"),
        Some(Duration::from_millis(500)),
        move |event| *slot2.lock().unwrap() = Some(event.clone()),
    );
    let handler_count_before = client.handler_count();

    client.send(query("r1"), None).await.unwrap();
    // Deliberately never send a request carrying request-id "r2".

    tokio::time::timeout(Duration::from_millis(800), async {
        loop {
            if r1_reply.lock().unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the r1 waiter should resolve against the server's echo reply");

    let r1 = r1_reply.lock().unwrap().take().unwrap();
    assert_eq!(echoed_request_id(&r1).as_deref(), Some("r1"));

    tokio::time::timeout(Duration::from_millis(800), async {
        loop {
            if r2_reply.lock().unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the r2 waiter should fire its timeout within 600ms of the 500ms deadline");

    let r2 = r2_reply.lock().unwrap().take().unwrap();
    assert_eq!(
        r2.data.as_ref().and_then(|d| d.map_get("error")),
        Some(&EdnValue::Keyword(Ident::new("timeout")))
    );
    assert_eq!(
        client.handler_count(),
        handler_count_before - 2,
        "both once-handlers should have unregistered themselves"
    );

    client.close();
    server.stop().await;
}
