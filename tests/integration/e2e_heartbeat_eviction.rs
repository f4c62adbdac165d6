//! A connection that never answers transport traffic (no ping reply, no
//! messages) gets evicted by the server's single background sweeper once
//! it's been idle past `heartbeat.idle_timeout`, its socket forced closed
//! with no further wire traffic.
use std::time::Duration;

use sente_lite_server::{start_server, ServerConfig};
use sente_lite_test_support::SilentPongClient;
use sente_lite_wire::chsk;

#[tokio::test]
async fn idle_connections_are_evicted_by_the_sweeper() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    config.heartbeat.sweep_interval = Duration::from_millis(50);
    config.heartbeat.idle_timeout = Duration::from_millis(150);
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let _client = SilentPongClient::connect(&url)
        .await
        .expect("handshake should complete even though the client stays silent afterward");

    let stats = server.stats().await;
    assert_eq!(stats.connections_open, 1);

    // Idle past the timeout, give at least one more sweep tick to run.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = server.stats().await;
    assert_eq!(
        stats.connections_open, 0,
        "the silent connection should have been swept away"
    );
    assert_eq!(stats.connections_closed, 1);

    server.stop().await;
}

#[tokio::test]
async fn a_client_that_answers_pings_is_never_evicted() {
    use sente_lite_test_support::RawClient;

    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    config.heartbeat.sweep_interval = Duration::from_millis(50);
    config.heartbeat.idle_timeout = Duration::from_millis(150);
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let mut client = RawClient::connect(&url).await.unwrap();
    let handshake = client.recv_event().await.unwrap();
    assert_eq!(handshake.id, chsk::HANDSHAKE);

    // The server proactively pings; replying with chsk/ws-pong bumps
    // `last_pong`, which is what the sweeper actually checks.
    for _ in 0..4 {
        let ping = client.recv_event().await.unwrap();
        assert_eq!(ping.id, chsk::WS_PING);
        client
            .send_event(sente_lite_wire::EventVector::new(chsk::WS_PONG))
            .await
            .unwrap();
    }

    let stats = server.stats().await;
    assert_eq!(stats.connections_open, 1, "an active connection must survive the sweeper");

    server.stop().await;
}
