//! End-to-end tests: real axum server, in-memory store, tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relayd::auth::{Identity, TokenIssuer};
use relayd::config::Config;
use relayd::routes::build_router;
use relayd::state::AppState;
use relayd::store::memory::MemoryStore;
use relayd::store::{
    ConversationId, MembershipResolver, Message as StoredMessage, MessageStore, StoreError,
};
use relayd::ws::AUTH_FAILED_CLOSE_CODE;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &[u8] = b"e2e-secret-do-not-use";

struct TestServer<S = MemoryStore> {
    addr: SocketAddr,
    state: Arc<AppState>,
    store: Arc<S>,
}

/// Start the server on a random port with conversation 7 between users 1 and 2.
async fn start_test_server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    store.insert_conversation(7, &[1, 2]);
    start_test_server_with(store).await
}

async fn start_test_server_with<S>(store: Arc<S>) -> TestServer<S>
where
    S: MessageStore + MembershipResolver + 'static,
{
    let mut config = Config::from_env();
    config.handshake_timeout = Duration::from_millis(500);
    let state = AppState::new(config, SECRET, Arc::clone(&store));

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state, store }
}

fn token_for(user_id: i64, username: &str) -> String {
    TokenIssuer::new(SECRET)
        .issue(
            &Identity {
                user_id,
                username: username.into(),
            },
            Duration::from_secs(60),
        )
        .unwrap()
}

async fn open(addr: SocketAddr, query: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
    ws
}

/// Connect with a query-string token and consume the `authenticated` event.
async fn connect(addr: SocketAddr, user_id: i64, username: &str) -> Client {
    let mut ws = open(addr, &format!("?token={}", token_for(user_id, username))).await;
    let ev = recv_json(&mut ws).await;
    assert_eq!(ev["type"], "authenticated");
    assert_eq!(ev["userId"], user_id);
    ws
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
        panic!("expected no event, got {msg:?}");
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Read the close frame that follows a rejected handshake.
async fn expect_auth_close(ws: &mut Client) {
    let ev = recv_json(ws).await;
    assert_eq!(ev, json!({"type": "error", "reason": "authentication error"}));

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), AUTH_FAILED_CLOSE_CODE)
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_message_fans_out_to_participants() {
    let server = start_test_server().await;
    let mut alice = connect(server.addr, 1, "alice").await;
    let mut bob = connect(server.addr, 2, "bob").await;
    let mut carol = connect(server.addr, 3, "carol").await;

    send_json(
        &mut alice,
        json!({"type": "sendMessage", "conversationId": 7, "content": "hi"}),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        let ev = recv_json(ws).await;
        assert_eq!(ev["type"], "message");
        assert_eq!(ev["conversationId"], 7);
        assert_eq!(ev["authorId"], 1);
        assert_eq!(ev["content"], "hi");
        assert!(ev["id"].is_i64());
        assert!(ev["createdAt"].is_string());
    }
    assert_silent(&mut carol).await;
    assert_eq!(server.store.message_count(), 1);
}

#[tokio::test]
async fn test_whitespace_message_rejected_locally() {
    let server = start_test_server().await;
    let mut alice = connect(server.addr, 1, "alice").await;
    let mut bob = connect(server.addr, 2, "bob").await;

    send_json(
        &mut alice,
        json!({"type": "sendMessage", "conversationId": "7", "content": "   "}),
    )
    .await;

    let ev = recv_json(&mut alice).await;
    assert_eq!(ev["type"], "error");
    assert_silent(&mut bob).await;
    assert_eq!(server.store.message_count(), 0);

    // Connection is still usable.
    send_json(
        &mut alice,
        json!({"type": "sendMessage", "conversationId": "7", "content": "ok"}),
    )
    .await;
    assert_eq!(recv_json(&mut alice).await["type"], "message");
    assert_eq!(recv_json(&mut bob).await["content"], "ok");
}

#[tokio::test]
async fn test_invalid_token_closes_connection() {
    let server = start_test_server().await;

    let mut ws = open(server.addr, "").await;
    let forged = TokenIssuer::new(b"wrong-secret")
        .issue(
            &Identity {
                user_id: 1,
                username: "alice".into(),
            },
            Duration::from_secs(60),
        )
        .unwrap();
    send_json(&mut ws, json!({"type": "auth", "token": forged})).await;

    expect_auth_close(&mut ws).await;
    assert!(!server.state.relay.registry().is_online(1));
    assert_eq!(server.state.relay.registry().user_count(), 0);
}

#[tokio::test]
async fn test_auth_frame_handshake() {
    let server = start_test_server().await;
    let mut ws = open(server.addr, "").await;
    send_json(&mut ws, json!({"type": "auth", "token": token_for(2, "bob")})).await;

    let ev = recv_json(&mut ws).await;
    assert_eq!(ev["type"], "authenticated");
    assert_eq!(ev["username"], "bob");
    assert!(server.state.relay.registry().is_online(2));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let server = start_test_server().await;
    let mut ws = open(server.addr, "").await;
    expect_auth_close(&mut ws).await;
    assert_eq!(server.state.relay.registry().user_count(), 0);
}

#[tokio::test]
async fn test_every_tab_receives_broadcast_once() {
    let server = start_test_server().await;
    let mut tab1 = connect(server.addr, 1, "alice").await;
    let mut tab2 = connect(server.addr, 1, "alice").await;
    let mut bob = connect(server.addr, 2, "bob").await;
    assert_eq!(server.state.relay.registry().connections_for(1).len(), 2);

    send_json(
        &mut bob,
        json!({"type": "sendMessage", "conversationId": 7, "content": "two tabs"}),
    )
    .await;

    for ws in [&mut tab1, &mut tab2, &mut bob] {
        let ev = recv_json(ws).await;
        assert_eq!(ev["content"], "two tabs");
        assert_silent(ws).await;
    }
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let server = start_test_server().await;
    let mut tab1 = connect(server.addr, 1, "alice").await;
    let _tab2 = connect(server.addr, 1, "alice").await;

    tab1.close(None).await.unwrap();

    let registry = server.state.relay.registry();
    let mut remaining = usize::MAX;
    for _ in 0..50 {
        remaining = registry.connections_for(1).len();
        if remaining == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remaining, 1);
    assert!(registry.is_online(1));
}

#[tokio::test]
async fn test_history_request() {
    let server = start_test_server().await;
    let mut alice = connect(server.addr, 1, "alice").await;
    for content in ["first", "second"] {
        send_json(
            &mut alice,
            json!({"type": "sendMessage", "conversationId": 7, "content": content}),
        )
        .await;
        recv_json(&mut alice).await;
    }

    send_json(&mut alice, json!({"type": "history", "conversationId": 7})).await;
    let ev = recv_json(&mut alice).await;
    assert_eq!(ev["type"], "history");
    let contents: Vec<_> = ev["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(contents, ["first", "second"]);
}

/// Memory store whose `append` parks until the test releases it.
struct GatedStore {
    inner: MemoryStore,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: i64,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.append(conversation_id, author_id, content).await
    }

    async fn history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.history(conversation_id).await
    }
}

#[async_trait]
impl MembershipResolver for GatedStore {
    async fn participants_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<std::collections::HashSet<i64>, StoreError> {
        self.inner.participants_of(conversation_id).await
    }
}

#[tokio::test]
async fn test_sender_close_mid_append_still_delivers() {
    let inner = MemoryStore::new();
    inner.insert_conversation(7, &[1, 2]);
    let store = Arc::new(GatedStore {
        inner,
        entered: Notify::new(),
        release: Notify::new(),
    });
    let server = start_test_server_with(Arc::clone(&store)).await;
    let mut alice = connect(server.addr, 1, "alice").await;
    let mut bob = connect(server.addr, 2, "bob").await;

    send_json(
        &mut alice,
        json!({"type": "sendMessage", "conversationId": 7, "content": "parting words"}),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(2), store.entered.notified())
        .await
        .expect("append never started");

    alice.close(None).await.unwrap();
    drop(alice);
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.release.notify_one();

    let ev = recv_json(&mut bob).await;
    assert_eq!(ev["type"], "message");
    assert_eq!(ev["authorId"], 1);
    assert_eq!(ev["content"], "parting words");
    assert_eq!(server.store.inner.message_count(), 1);

    let registry = server.state.relay.registry();
    let mut online = true;
    for _ in 0..50 {
        online = registry.is_online(1);
        if !online {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!online);
}
