//! When a server drops its listener mid-session: the lifetime reconnect
//! counter keeps climbing rather than resetting on each handshake; a once
//! handler waiting on an event that will never arrive is force-fired with a
//! `{error: :closed, reason: :disconnected}` notification instead of
//! hanging until its own timeout; and once the server comes back, the
//! `chsk/state` handler sees `first-open? == false`, distinguishing the
//! reconnect from the original open.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_lite_client::config::{HeartbeatConfig, ReconnectConfig};
use sente_lite_client::{Client, ClientConfig, ConnectionState};
use sente_lite_server::{start_server, ServerConfig};
use sente_lite_wire::{chsk, EdnValue, EventVector};

fn client_config(server_url: String) -> ClientConfig {
    ClientConfig {
        server_url,
        token: None,
        reconnect: ReconnectConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
        },
        heartbeat: HeartbeatConfig::default(),
        send_queue: sente_lite_client::queue::SendQueueConfig::default(),
        wrap_recv: false,
    }
}

#[tokio::test]
async fn client_reconnects_after_the_server_restarts_on_the_same_port() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    let server = start_server(config.clone()).await.unwrap();
    let addr = server.local_addr();
    config.bind_addr = addr.to_string();

    let client = Client::connect(client_config(format!("ws://{addr}/ws")));

    // Register the chsk/state handler before the client reaches Connected:
    // the first-open dispatch fires synchronously right after the socket
    // connects, with no await in between, so a handler registered after
    // `wait_for_state(Connected)` would reliably miss it.
    let reconnected = Arc::new(AtomicBool::new(false));
    let opened_first_time = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reconnected);
    let first_flag = Arc::clone(&opened_first_time);
    client.on(chsk::STATE, move |event| {
        let Some(data) = &event.data else { return };
        let open = data.map_get("open?") == Some(&EdnValue::Bool(true));
        let first_open = data.map_get("first-open?") == Some(&EdnValue::Bool(true));
        if open && first_open {
            first_flag.store(true, Ordering::SeqCst);
        }
        if open && !first_open {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let closed_notification: Arc<Mutex<Option<EventVector>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&closed_notification);
    client.take("x/never", None, move |event| {
        *slot.lock().unwrap() = Some(event.clone());
    });

    wait_for_state(&client, ConnectionState::Connected, Duration::from_secs(2)).await;
    let attempts_before = client.reconnect_count();

    server.stop().await;

    // The client should notice the drop and start reconnecting.
    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(2)).await;

    let notification = wait_for(
        || closed_notification.lock().unwrap().clone(),
        Duration::from_secs(2),
    )
    .await
    .expect("the once handler should be force-fired on disconnect, not left hanging");
    let data = notification.data.unwrap();
    assert_eq!(data.map_get("error"), Some(&EdnValue::Keyword(sente_lite_wire::Ident::new("closed"))));
    assert_eq!(data.map_get("reason"), Some(&EdnValue::Keyword(sente_lite_wire::Ident::new("disconnected"))));

    let server2 = start_server(config).await.unwrap();
    assert_eq!(server2.local_addr(), addr, "server must rebind the same port for this test to prove reconnection");

    wait_for_state(&client, ConnectionState::Connected, Duration::from_secs(5)).await;
    assert!(
        client.reconnect_count() > attempts_before,
        "reconnect_count is a lifetime counter and must keep growing across reconnects"
    );
    assert!(opened_first_time.load(Ordering::SeqCst), "the original open should have fired first-open? true");
    assert!(
        reconnected.load(Ordering::SeqCst),
        "the second open should be observable as a reconnect (first-open? false), not another on-open"
    );

    client.send_now(EventVector::new("app/ping")).unwrap();

    client.close();
    server2.stop().await;
}

async fn wait_for_state(client: &Client, target: ConnectionState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.state() == target {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for client state {target:?}, last seen {:?}", client.state());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
