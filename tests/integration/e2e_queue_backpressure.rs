//! The client's send queue has a bounded capacity. `send_now` drops once
//! the queue is full instead of blocking, while `send` waits up to the
//! configured timeout for room to free up.
use std::time::Duration;

use sente_lite_client::config::{HeartbeatConfig, ReconnectConfig};
use sente_lite_client::queue::SendQueueConfig;
use sente_lite_client::{Client, ClientConfig, ClientError};
use sente_lite_server::{start_server, ServerConfig};
use sente_lite_wire::EventVector;

fn client_config(server_url: String, queue_capacity: usize) -> ClientConfig {
    ClientConfig {
        server_url,
        token: None,
        reconnect: ReconnectConfig::default(),
        heartbeat: HeartbeatConfig::default(),
        send_queue: SendQueueConfig {
            capacity: queue_capacity,
            default_timeout: Some(Duration::from_millis(100)),
            flush_interval: Duration::from_millis(20),
        },
        wrap_recv: false,
    }
}

#[tokio::test]
async fn send_now_drops_once_the_queue_fills_up() {
    // Use a server that never drains its socket reads so the client's send
    // task backs up: the queue receiver is only ever consumed by the
    // per-connection socket write loop, which we starve by never polling
    // the server's accept route at all (no server started). Connecting to
    // a closed port keeps the client perpetually "Connecting", so nothing
    // ever drains the queue and capacity is the only limit in play.
    let client = Client::connect(client_config("ws://127.0.0.1:1".to_owned(), 3));

    assert!(client.send_now(EventVector::new("app/one")).is_ok());
    assert!(client.send_now(EventVector::new("app/two")).is_ok());
    assert!(client.send_now(EventVector::new("app/three")).is_ok());
    let result = client.send_now(EventVector::new("app/four"));
    assert!(matches!(result, Err(ClientError::QueueFull)));

    let stats = client.queue_stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.depth, 3);

    client.close();
}

#[tokio::test]
async fn send_times_out_when_the_queue_stays_full() {
    let client = Client::connect(client_config("ws://127.0.0.1:1".to_owned(), 1));
    client.send_now(EventVector::new("app/one")).unwrap();

    let start = tokio::time::Instant::now();
    let result = client
        .send(EventVector::new("app/two"), Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(ClientError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(90));

    client.close();
}

#[tokio::test]
async fn a_real_server_eventually_drains_a_backed_up_queue() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let client = Client::connect(client_config(url, 4));
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..4 {
        client
            .send_now(EventVector::new(format!("app/burst-{i}")))
            .unwrap();
    }
    // The connection loop should drain the queue against the live server
    // well within the queue's own timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.send_now(EventVector::new("app/after-drain")).is_ok());

    client.close();
    server.stop().await;
}
