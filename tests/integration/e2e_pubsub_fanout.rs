//! Two raw clients subscribe to the same channel. One publishes with
//! `exclude-sender?: true`; the other subscriber receives the fan-out as
//! `sente-lite/channel-msg` and the publisher does not, matching the
//! pub/sub scenario end to end.
use std::time::Duration;

use sente_lite_server::{start_server, ServerConfig};
use sente_lite_test_support::RawClient;
use sente_lite_wire::{chsk, sente_lite, EdnValue, EventVector, Ident};

fn kw(name: &str) -> EdnValue {
    EdnValue::Keyword(Ident::new(name))
}

async fn subscribe(client: &mut RawClient, channel_id: &str) {
    client
        .send_event(EventVector::with_data(
            sente_lite::SUBSCRIBE,
            EdnValue::Map(vec![(kw("channel-id"), EdnValue::Str(channel_id.to_owned()))]),
        ))
        .await
        .unwrap();
    let ack = client.recv_event().await.unwrap();
    assert_eq!(ack.id, sente_lite::SUBSCRIBED);
    let data = ack.data.unwrap();
    assert_eq!(data.map_get("channel-id").and_then(EdnValue::as_str), Some(channel_id));
    assert_eq!(data.map_get("success"), Some(&EdnValue::Bool(true)));
}

#[tokio::test]
async fn publishing_with_exclude_sender_reaches_other_subscribers_only() {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".to_owned();
    let server = start_server(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let mut a = RawClient::connect(&url).await.unwrap();
    let handshake = a.recv_event().await.unwrap();
    assert_eq!(handshake.id, chsk::HANDSHAKE);
    subscribe(&mut a, "room/42").await;

    let mut b = RawClient::connect(&url).await.unwrap();
    let _ = b.recv_event().await.unwrap();
    subscribe(&mut b, "room/42").await;

    b.send_event(EventVector::with_data(
        sente_lite::PUBLISH,
        EdnValue::Map(vec![
            (kw("channel-id"), EdnValue::Str("room/42".to_owned())),
            (
                kw("data"),
                EdnValue::Map(vec![(kw("msg"), EdnValue::Str("hi".to_owned()))]),
            ),
            (kw("exclude-sender?"), EdnValue::Bool(true)),
        ]),
    ))
    .await
    .unwrap();

    let a_got = tokio::time::timeout(Duration::from_secs(2), a.recv_event())
        .await
        .expect("a should receive the fanned-out message")
        .unwrap();
    assert_eq!(a_got.id, sente_lite::CHANNEL_MSG);
    let data = a_got.data.unwrap();
    assert_eq!(data.map_get("channel-id").and_then(EdnValue::as_str), Some("room/42"));
    assert_eq!(
        data.map_get("data").and_then(EdnValue::as_map).and_then(|m| m[0].1.as_str()),
        Some("hi")
    );
    assert!(data.map_get("from").and_then(EdnValue::as_str).is_some());

    let b_got = tokio::time::timeout(Duration::from_millis(300), b.recv_event()).await;
    assert!(b_got.is_err(), "the excluded sender must not receive its own publish");

    let stats = server.stats().await;
    assert_eq!(stats.channel_count, 1);

    server.stop().await;
}
