//! Integration tests for WebSocket connect, join, broadcast, direct messages,
//! ping/pong, liveness timeouts and disconnect cleanup, against the
//! in-process backend.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hub_server::chat::messages::{post_public, ChatMessage, MEMBERS_KEY, PUBLIC_HISTORY_KEY};
use hub_server::state::{AppState, HubSettings};
use hub_server::store::{Backend, HistoryStore, MemoryStore, StoreError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Helper: start the server on a random port with its fan-out listeners
/// running. Returns the state (for seeding and inspection) and the address.
async fn start_test_server() -> (AppState, SocketAddr) {
    start_server(AppState::in_memory(HubSettings::default())).await
}

async fn start_server(state: AppState) -> (AppState, SocketAddr) {
    hub_server::chat::listeners::spawn_topic_listeners(&state)
        .await
        .expect("Failed to start fan-out listeners");

    let app = hub_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (state, addr)
}

/// Connect and consume the init snapshot, returning it alongside the halves.
async fn connect(addr: SocketAddr) -> (WsWrite, WsRead, serde_json::Value) {
    let ws_url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    let (write, mut read) = ws_stream.split();

    let init = next_text(&mut read).await;
    let init: serde_json::Value = serde_json::from_str(&init).expect("init should be JSON");
    assert_eq!(init["type"], "init");
    (write, read, init)
}

async fn send(write: &mut WsWrite, text: &str) {
    write
        .send(Message::Text(text.into()))
        .await
        .expect("Failed to send frame");
}

async fn next_text(read: &mut WsRead) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Expected a frame within timeout");
        match msg {
            Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }
}

/// Read frames until one satisfies `pred`, skipping the rest (presence
/// events and welcome text arrive in no fixed order relative to each other).
async fn wait_for<F>(read: &mut WsRead, mut pred: F) -> String
where
    F: FnMut(&str) -> bool,
{
    for _ in 0..20 {
        let text = next_text(read).await;
        if pred(&text) {
            return text;
        }
    }
    panic!("Expected frame never arrived");
}

/// Join and wait until both the welcome and this join's member_add arrived.
async fn join(write: &mut WsWrite, read: &mut WsRead, name: &str) {
    send(write, &format!("join:{}", name)).await;
    let welcome = format!("Welcome {}!", name);
    let mut got_welcome = false;
    let mut got_member_add = false;
    while !(got_welcome && got_member_add) {
        let text = next_text(read).await;
        if text == welcome {
            got_welcome = true;
        } else if is_member_event(&text, "member_add", name) {
            got_member_add = true;
        }
    }
}

fn is_member_event(text: &str, kind: &str, name: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v["type"] == kind && v["name"] == name)
        .unwrap_or(false)
}

/// Poll the registry until it holds `expected` connections.
async fn wait_for_connection_count(state: &AppState, expected: usize) {
    for _ in 0..60 {
        if state.connections.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "Expected {} connections, still have {}",
        expected,
        state.connections.len()
    );
}

async fn assert_no_text(read: &mut WsRead, millis: u64) {
    let result = tokio::time::timeout(Duration::from_millis(millis), read.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("Expected silence, got: {}", text);
    }
}

#[tokio::test]
async fn test_init_snapshot_carries_members_and_recent_history() {
    let (state, addr) = start_test_server().await;
    for i in 1..=25 {
        let message = ChatMessage::at("seed", &format!("m{}", i), 1_000 + i);
        let payload = serde_json::to_string(&message).unwrap();
        state
            .store
            .append(PUBLIC_HISTORY_KEY, message.time, &payload)
            .await
            .unwrap();
    }

    let (mut write, mut read, _) = connect(addr).await;
    join(&mut write, &mut read, "alice").await;

    let (_write2, _read2, init) = connect(addr).await;
    assert_eq!(init["members"], serde_json::json!(["alice"]));
    let history = init["history"].as_array().unwrap();
    assert_eq!(history.len(), 20);
    assert_eq!(history[0]["text"], "m6");
    assert_eq!(history[19]["text"], "m25");
}

#[tokio::test]
async fn test_public_message_reaches_everyone_including_sender() {
    let (_state, addr) = start_test_server().await;
    let (mut alice_w, mut alice_r, _) = connect(addr).await;
    let (_bob_w, mut bob_r, _) = connect(addr).await;

    send(&mut alice_w, "msg:alice:hello:world").await;

    for read in [&mut alice_r, &mut bob_r] {
        let text = wait_for(read, |t| t.contains("hello:world")).await;
        let message: ChatMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(message.user, "alice");
        assert_eq!(message.text, "hello:world");
    }
    // Exactly one copy for the sender
    assert_no_text(&mut alice_r, 200).await;
}

#[tokio::test]
async fn test_join_is_announced_to_other_connections() {
    let (_state, addr) = start_test_server().await;
    let (mut alice_w, mut alice_r, _) = connect(addr).await;
    let (_bob_w, mut bob_r, _) = connect(addr).await;

    join(&mut alice_w, &mut alice_r, "alice").await;

    wait_for(&mut bob_r, |t| is_member_event(t, "member_add", "alice")).await;
}

#[tokio::test]
async fn test_direct_message_reaches_receiver_and_echoes_to_sender() {
    let (_state, addr) = start_test_server().await;
    let (mut alice_w, mut alice_r, _) = connect(addr).await;
    let (mut bob_w, mut bob_r, _) = connect(addr).await;
    let (_carol_w, mut carol_r, _) = connect(addr).await;
    join(&mut alice_w, &mut alice_r, "alice").await;
    join(&mut bob_w, &mut bob_r, "bob").await;

    send(&mut alice_w, "dm:alice:bob:secret:code").await;

    let received = wait_for(&mut bob_r, |t| t.contains("secret:code")).await;
    let echo = wait_for(&mut alice_r, |t| t.contains("secret:code")).await;
    assert_eq!(received, echo);
    let message: ChatMessage = serde_json::from_str(&received).unwrap();
    assert_eq!(message.user, "alice");
    assert_eq!(message.text, "secret:code");

    // Bystanders only see presence traffic, never the DM
    let result = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let text = next_text(&mut carol_r).await;
            assert!(!text.contains("secret:code"), "DM leaked to bystander");
        }
    })
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_disconnect_after_join_announces_member_remove() {
    let (state, addr) = start_test_server().await;
    let (mut alice_w, mut alice_r, _) = connect(addr).await;
    let (_bob_w, mut bob_r, _) = connect(addr).await;
    join(&mut alice_w, &mut alice_r, "alice").await;

    alice_w.send(Message::Close(None)).await.expect("Failed to send close");
    drop(alice_r);

    wait_for(&mut bob_r, |t| is_member_event(t, "member_remove", "alice")).await;
    assert!(state
        .store
        .set_members(MEMBERS_KEY)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_disconnect_without_join_is_silent() {
    let (state, addr) = start_test_server().await;
    let (_bob_w, mut bob_r, _) = connect(addr).await;

    {
        let (mut anon_w, _anon_r, _) = connect(addr).await;
        anon_w.send(Message::Close(None)).await.expect("Failed to send close");
    }

    assert_no_text(&mut bob_r, 300).await;
    assert_eq!(state.connections.len(), 1);
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let (_state, addr) = start_test_server().await;
    let (mut write, mut read, _) = connect(addr).await;

    write
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected pong within timeout");

    match msg {
        Some(Ok(Message::Pong(data))) => {
            assert_eq!(data.as_ref(), &[42, 43, 44], "Pong data should match ping");
        }
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_commands_get_no_reply() {
    let (_state, addr) = start_test_server().await;
    let (mut write, mut read, _) = connect(addr).await;

    send(&mut write, "dm:alice:bob").await;
    send(&mut write, "msg:nocolon").await;
    send(&mut write, "join:   ").await;
    send(&mut write, "hello there").await;

    assert_no_text(&mut read, 300).await;
}

/// History store whose member lookup is slow, widening the gap between a
/// socket being accepted and its init snapshot being ready.
struct SlowMembersStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl HistoryStore for SlowMembersStore {
    async fn append(&self, key: &str, score: i64, entry: &str) -> Result<(), StoreError> {
        self.inner.append(key, score, entry).await
    }

    async fn recent(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.inner.recent(key, count).await
    }

    async fn trim(&self, key: &str, keep: usize) -> Result<(), StoreError> {
        self.inner.trim(key, keep).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_members(key).await
    }
}

#[tokio::test]
async fn test_init_is_first_frame_even_with_live_traffic() {
    let history = Arc::new(SlowMembersStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(300),
    });
    let backend = Backend {
        history,
        bus: Arc::new(MemoryStore::new()),
    };
    let (state, addr) = start_server(AppState::new(backend, HubSettings::default())).await;

    let ws_url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    let (_write, mut read) = ws_stream.split();

    // Published while the new connection is still building its snapshot
    tokio::time::sleep(Duration::from_millis(100)).await;
    post_public(&state, "other", "live").await;

    let first: serde_json::Value = serde_json::from_str(&next_text(&mut read).await).unwrap();
    assert_eq!(first["type"], "init");

    // Traffic after init still flows
    post_public(&state, "other", "after").await;
    let text = wait_for(&mut read, |t| t.contains("after")).await;
    let message: ChatMessage = serde_json::from_str(&text).unwrap();
    assert_eq!(message.user, "other");
}

#[tokio::test]
async fn test_unanswered_pings_tear_connection_down() {
    let settings = HubSettings {
        ping_interval: Duration::from_millis(200),
        pong_timeout: Duration::from_millis(200),
        idle_timeout: None,
        ..HubSettings::default()
    };
    let (state, addr) = start_server(AppState::in_memory(settings)).await;
    let (_bob_w, mut bob_r, _) = connect(addr).await;
    let (mut alice_w, mut alice_r, _) = connect(addr).await;
    join(&mut alice_w, &mut alice_r, "alice").await;

    // alice stops reading, so her client never answers another ping
    wait_for(&mut bob_r, |t| is_member_event(t, "member_remove", "alice")).await;
    assert!(state.connections.connections_named("alice").is_empty());
    assert!(state.store.set_members(MEMBERS_KEY).await.unwrap().is_empty());
    drop((alice_w, alice_r));
}

#[tokio::test]
async fn test_silent_connection_is_closed_after_idle_timeout() {
    let settings = HubSettings {
        idle_timeout: Some(Duration::from_millis(300)),
        ..HubSettings::default()
    };
    let (state, addr) = start_server(AppState::in_memory(settings)).await;
    let (_write, mut read, _) = connect(addr).await;
    assert_eq!(state.connections.len(), 1);

    wait_for_connection_count(&state, 0).await;

    // The server side is gone, so the stream ends rather than idling forever
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match read.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Text(text))) => panic!("Unexpected text: {}", text),
                _ => return,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream should end after the idle close");
}

#[tokio::test]
async fn test_connection_that_falls_behind_is_closed() {
    let settings = HubSettings {
        outbound_capacity: 4,
        ..HubSettings::default()
    };
    let (state, addr) = start_server(AppState::in_memory(settings)).await;
    let (_write, _read, _) = connect(addr).await;
    assert_eq!(state.connections.len(), 1);

    // No await in between, so the writer cannot drain while the queue fills
    let delivered: usize = (0..50)
        .map(|i| hub_server::ws::broadcast::broadcast_text(&state.connections, &format!("burst {}", i)))
        .sum();
    assert_eq!(delivered, 4);

    wait_for_connection_count(&state, 0).await;
}
