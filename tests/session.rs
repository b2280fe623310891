//! End-to-end scenarios driving the whole actor through the public
//! [`Client`] facade with [`centrifuge_session::mock`] standing in for a
//! real WebSocket: connect-and-close, a transient disconnect honoring the
//! server's reconnect override, a terminal disconnect, server-subscription
//! bookkeeping from the connect reply, a client subscription round trip,
//! connection token refresh, and a correlated request/reply. Command queue
//! backpressure itself has its own unit tests in `queue.rs`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::value::RawValue;
use serde_json::Value;

use centrifuge_session::codec::json::JsonCodec;
use centrifuge_session::config::{ClientConfig, SubscriptionConfig};
use centrifuge_session::mock::{MockDialer, MockEpisode};
use centrifuge_session::{Client, ConnectionState, SubscriptionEvent};

fn counting_token_callback(calls: Arc<std::sync::atomic::AtomicUsize>) -> centrifuge_session::config::TokenCallback {
    Arc::new(move || {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            "callback-token".to_string()
        })
    })
}

fn raw(value: serde_json::Value) -> Box<RawValue> {
    RawValue::from_string(value.to_string()).unwrap()
}

/// Extracts the `id` field of the lone command a fresh episode's writer
/// task has sent, polling briefly since the writer drains its queue on a
/// separate task from the one calling this helper.
async fn sent_id(episode: &MockEpisode) -> u32 {
    for _ in 0..50 {
        let sent = episode.take_sent();
        if let Some(frame) = sent.into_iter().next() {
            let value: Value = serde_json::from_slice(&frame).unwrap();
            return value["id"].as_u64().unwrap() as u32;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("writer task never sent a command");
}

async fn next_episode(episodes: &mut tokio::sync::mpsc::UnboundedReceiver<MockEpisode>) -> MockEpisode {
    tokio::time::timeout(Duration::from_secs(1), episodes.recv())
        .await
        .expect("dial never observed")
        .expect("dialer channel closed")
}

fn connect_ok_frame(id: u32, client_id: &str) -> Vec<u8> {
    serde_json::json!({ "id": id, "result": { "client": client_id, "subs": {} } })
        .to_string()
        .into_bytes()
}

/// Dials, completes one connect handshake and returns the episode so the
/// test can keep driving pushes/replies over it.
async fn connect(
    client: &Client,
    episodes: &mut tokio::sync::mpsc::UnboundedReceiver<MockEpisode>,
    url: &str,
    client_id: &str,
) -> MockEpisode {
    let connect_call = tokio::spawn({
        let client = client.clone();
        let url = url.to_string();
        async move { client.connect(url).await }
    });
    let episode = next_episode(episodes).await;
    let id = sent_id(&episode).await;
    episode.push_frame(connect_ok_frame(id, client_id)).await;
    connect_call.await.unwrap().expect("connect should succeed");
    episode
}

fn new_client(dialer: Arc<MockDialer>) -> Client {
    Client::new(ClientConfig::default(), Arc::new(JsonCodec::new()), dialer)
}

#[tokio::test]
async fn connect_then_close_releases_the_transport_and_refuses_further_calls() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));

    connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;
    assert!(matches!(client.state(), ConnectionState::Connected { .. }));

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client.connect("wss://example.test/connection/websocket").await.unwrap_err();
    assert!(err.to_string().to_lowercase().contains("closed"));
}

#[tokio::test]
async fn transient_disconnect_honors_the_servers_reconnect_override() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));

    let mut episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let next_at = SystemTime::now() + Duration::from_millis(30);
    let next_at_ms = next_at.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let push = serde_json::json!({
        "push": {
            "type": "disconnect",
            "code": 2500,
            "reason": "shutdown",
            "reconnect": true,
            "nextReconnectAt": next_at_ms,
            "reconnectUrl": "wss://example.test/failover/websocket",
        }
    });
    episode.push_frame(push.to_string().into_bytes()).await;

    // the override is recorded on the metrics snapshot while the session
    // waits out the server-given delay (§4.6, §8 scenario 2)
    tokio::time::sleep(Duration::from_millis(5)).await;
    let snapshot = client.metrics();
    assert_eq!(snapshot.reconnect_url.as_deref(), Some("wss://example.test/failover/websocket"));
    assert!(snapshot.next_reconnect_at_ms.is_some());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let second_episode = next_episode(&mut episodes).await;
    let id = sent_id(&second_episode).await;
    second_episode.push_frame(connect_ok_frame(id, "client-1")).await;

    tokio::time::timeout(Duration::from_secs(1), client.ready()).await.unwrap().unwrap();
    assert!(matches!(client.state(), ConnectionState::Connected { .. }));

    let snapshot = client.metrics();
    assert_eq!(snapshot.reconnect_url, None);
    assert_eq!(snapshot.next_reconnect_at_ms, None);
}

#[tokio::test]
async fn disconnect_with_reconnect_false_is_terminal() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));

    let mut episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let push = serde_json::json!({
        "push": { "type": "disconnect", "code": 3000, "reason": "invalid token", "reconnect": false }
    });
    episode.push_frame(push.to_string().into_bytes()).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let result = tokio::time::timeout(Duration::from_millis(50), episodes.recv()).await;
    assert!(result.is_err(), "a non-reconnectable disconnect must not redial");
}

#[tokio::test]
async fn connect_reply_populates_server_subscriptions() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));

    let connect_call = tokio::spawn({
        let client = client.clone();
        async move { client.connect("wss://example.test/connection/websocket").await }
    });
    let episode = next_episode(&mut episodes).await;
    let id = sent_id(&episode).await;
    let reply = serde_json::json!({
        "id": id,
        "result": {
            "client": "client-1",
            "subs": { "news": { "recoverable": true, "epoch": "ep1", "offset": 7 } },
        }
    });
    episode.push_frame(reply.to_string().into_bytes()).await;
    connect_call.await.unwrap().unwrap();

    let subs = client.server_subscriptions().await;
    let news = subs.get("news").expect("server subscription should be registered");
    assert!(news.recoverable);
    assert_eq!(news.epoch, "ep1");
    assert_eq!(news.offset, 7);
}

#[tokio::test]
async fn client_subscription_round_trips_a_publication() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let handle = client.new_subscription("news", SubscriptionConfig::default()).await.unwrap();

    let subscribe = tokio::spawn(async move { handle.subscribe().await.map(|_| handle) });

    let id = sent_id(&episode).await;
    let reply = serde_json::json!({ "id": id, "result": {} });
    episode.push_frame(reply.to_string().into_bytes()).await;
    let mut handle = subscribe.await.unwrap().unwrap();

    let publication = serde_json::json!({
        "push": { "type": "publication", "channel": "news", "data": { "headline": "hi" }, "offset": 1, "epoch": "ep1" }
    });
    episode.push_frame(publication.to_string().into_bytes()).await;

    let event = tokio::time::timeout(Duration::from_secs(1), handle.recv()).await.unwrap().unwrap();
    match event {
        SubscriptionEvent::Publication { data, offset } => {
            assert_eq!(offset, 1);
            assert_eq!(data.get(), r#"{"headline":"hi"}"#);
        }
        other => panic!("expected a publication event, got {other:?}"),
    }
}

#[tokio::test]
async fn a_refresh_push_schedules_a_connection_refresh_command() {
    let (dialer, mut episodes) = MockDialer::new();
    let mut config = ClientConfig::default();
    config.token = Some("initial-token".to_string());
    let client = Client::new(config, Arc::new(JsonCodec::new()), Arc::new(dialer));

    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let refresh_push = serde_json::json!({ "push": { "type": "refresh", "ttl": 1, "expires": true } });
    episode.push_frame(refresh_push.to_string().into_bytes()).await;

    let sent = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let frames = episode.take_sent();
            if let Some(frame) = frames.into_iter().next() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expected a refresh command to be sent once the deadline elapsed");

    let value: Value = serde_json::from_slice(&sent).unwrap();
    assert_eq!(value["method"], "refresh");
    assert_eq!(value["params"]["token"], "initial-token");
}

#[tokio::test]
async fn publish_enqueues_and_awaits_the_correlated_reply() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let publish_call = tokio::spawn({
        let client = client.clone();
        async move { client.publish("news", raw(serde_json::json!({ "x": 1 }))).await }
    });

    let id = sent_id(&episode).await;
    let reply = serde_json::json!({ "id": id, "result": {} });
    episode.push_frame(reply.to_string().into_bytes()).await;

    publish_call.await.unwrap().unwrap();
}

#[tokio::test]
async fn token_callback_is_used_over_the_static_token_on_connect() {
    let (dialer, mut episodes) = MockDialer::new();
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut config = ClientConfig::default();
    config.token = Some("static-token".to_string());
    config.token_callback = Some(counting_token_callback(calls.clone()));
    let client = Client::new(config, Arc::new(JsonCodec::new()), Arc::new(dialer));

    let connect_call = tokio::spawn({
        let client = client.clone();
        async move { client.connect("wss://example.test/connection/websocket").await }
    });
    let episode = next_episode(&mut episodes).await;

    let frame = loop {
        let sent = episode.take_sent();
        if let Some(frame) = sent.into_iter().next() {
            break frame;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value["params"]["token"], "callback-token");
    let id = value["id"].as_u64().unwrap() as u32;

    episode.push_frame(connect_ok_frame(id, "client-1")).await;
    connect_call.await.unwrap().unwrap();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscribe_reaches_subscribed_state_on_a_successful_reply() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let handle = client.new_subscription("news", SubscriptionConfig::default()).await.unwrap();
    let subscribe_call = tokio::spawn(async move {
        let result = handle.subscribe().await;
        (handle, result)
    });

    let id = sent_id(&episode).await;
    let reply = serde_json::json!({ "id": id, "result": { "recoverable": true, "epoch": "ep1", "offset": 3 } });
    episode.push_frame(reply.to_string().into_bytes()).await;

    let (_handle, result) = subscribe_call.await.unwrap();
    result.expect("subscribe should succeed");
}

#[tokio::test]
async fn a_temporary_subscribe_failure_schedules_a_retry() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let handle = client.new_subscription("news", SubscriptionConfig::default()).await.unwrap();
    let subscribe_call = tokio::spawn(async move {
        let result = handle.subscribe().await;
        (handle, result)
    });

    let id = sent_id(&episode).await;
    let reply = serde_json::json!({
        "id": id,
        "error": { "code": 109, "message": "internal error", "temporary": true }
    });
    episode.push_frame(reply.to_string().into_bytes()).await;

    let (_handle, result) = subscribe_call.await.unwrap();
    assert!(result.is_err());

    // the backoff schedule re-issues a Subscribe for the same channel
    // without any further caller action.
    let retried = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let sent = episode.take_sent();
            if let Some(frame) = sent.into_iter().next() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expected a retried subscribe command");

    let value: Value = serde_json::from_slice(&retried).unwrap();
    assert_eq!(value["params"]["channel"], "news");
}

#[tokio::test]
async fn a_failed_call_is_published_to_the_errors_stream() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let mut errors = client.errors();

    let publish_call = tokio::spawn({
        let client = client.clone();
        async move { client.publish("news", raw(serde_json::json!({ "x": 1 }))).await }
    });

    let id = sent_id(&episode).await;
    let reply = serde_json::json!({ "id": id, "error": { "code": 100, "message": "bad request", "temporary": false } });
    episode.push_frame(reply.to_string().into_bytes()).await;

    assert!(publish_call.await.unwrap().is_err());

    let event = tokio::time::timeout(Duration::from_secs(1), errors.recv()).await.unwrap().unwrap();
    assert!(event.message.to_lowercase().contains("bad request"));
}

#[tokio::test]
async fn metrics_count_replies_by_command_kind() {
    let (dialer, mut episodes) = MockDialer::new();
    let client = new_client(Arc::new(dialer));
    let episode = connect(&client, &mut episodes, "wss://example.test/connection/websocket", "client-1").await;

    let publish_call = tokio::spawn({
        let client = client.clone();
        async move { client.publish("news", raw(serde_json::json!({ "x": 1 }))).await }
    });
    let id = sent_id(&episode).await;
    episode.push_frame(serde_json::json!({ "id": id, "result": {} }).to_string().into_bytes()).await;
    publish_call.await.unwrap().unwrap();

    let snapshot = client.metrics();
    assert_eq!(snapshot.reply_kind_counts.get("publish"), Some(&1));
}
