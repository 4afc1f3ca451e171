//! WebSocket transport for the relay.
//!
//! Flow per connection:
//! 1. Accept WS upgrade, spawn the writer task
//! 2. Authenticate from the first `auth` frame or `?token=` (bounded wait)
//! 3. Reader task parses frames into a bounded queue; the processing loop
//!    drains it in order. A full queue stops socket reads.
//! 4. On close: stop processing queued events, deregister

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::error::RelayError;
use crate::protocol::{parse_client_event, ClientEvent, ServerEvent};
use crate::registry::ConnectionId;
use crate::relay::Session;
use crate::state::AppState;

/// Close code sent when the handshake fails.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4001;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;
type InboundTx = mpsc::Sender<Result<ClientEvent, RelayError>>;
type InboundRx = mpsc::Receiver<Result<ClientEvent, RelayError>>;

/// Query parameters of the upgrade request. Browsers cannot set headers on
/// a WebSocket upgrade, so `token` is accepted here, but the `auth` frame is
/// preferred: it keeps the credential out of URLs.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Axum handler for GET /ws — upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, query_token: Option<String>) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut session = state.relay.accept(tx);
    let conn_id = session.id();
    let writer = tokio::spawn(writer_task(sink, rx, conn_id));

    // ── Phase 1: handshake ──────────────────────────────────
    let token = match query_token {
        Some(token) => Ok(token),
        None => wait_for_token(&mut stream, state.config.handshake_timeout).await,
    };
    let authed = match token {
        Ok(token) => session.authenticate(&token).map(|_| ()),
        Err(e) => {
            warn!(conn_id = %conn_id, "handshake failed: {e}");
            session.reject(&e);
            Err(e)
        }
    };

    if authed.is_err() {
        // Dropping the session drops the last outbox sender, so the writer
        // flushes the error event and hands the sink back.
        drop(session);
        if let Ok(Some(mut sink)) = writer.await {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: AUTH_FAILED_CLOSE_CODE,
                    reason: "authentication error".into(),
                })))
                .await;
        }
        return;
    }

    // ── Phase 2: event loop ─────────────────────────────────
    let closed = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(state.config.event_queue_len);
    let reader = tokio::spawn(reader_task(stream, event_tx, closed.clone(), conn_id));

    run_session(&mut session, event_rx, &closed).await;

    // ── Phase 3: cleanup ────────────────────────────────────
    session.close();
    reader.abort();
    debug!(conn_id = %conn_id, "connection task finished");
}

/// Drain queued events in arrival order until the transport closes.
///
/// Once `closed` fires, queued events that have not started are dropped.
/// An event already being processed runs to completion, so a message that
/// reached storage is still fanned out.
pub async fn run_session(
    session: &mut Session,
    mut events: InboundRx,
    closed: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = events.recv() => match next {
                Some(Ok(event)) => {
                    let _ = session.process(event).await;
                }
                Some(Err(e)) => session.reject(&e),
                None => break,
            },
        }
    }
}

/// Wait for the first frame, which must be `{"type":"auth","token":..}`.
async fn wait_for_token(stream: &mut WsStream, limit: Duration) -> Result<String, RelayError> {
    let msg = tokio::time::timeout(limit, next_text(stream))
        .await
        .map_err(|_| RelayError::Auth(AuthError::Timeout))??;

    match parse_client_event(&msg) {
        Ok(ClientEvent::Auth(auth)) => Ok(auth.token),
        Ok(_) => Err(RelayError::Auth(AuthError::Missing)),
        Err(e) => Err(RelayError::Auth(AuthError::Malformed(e.to_string()))),
    }
}

/// Next text frame, skipping control and binary frames.
async fn next_text(stream: &mut WsStream) -> Result<String, RelayError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::Protocol(
                    "connection closed before authentication".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RelayError::Protocol(format!("ws error: {e}"))),
        }
    }
}

/// Parse frames into the inbound queue. `send` waits while the queue is
/// full, so no further frames are read and TCP backpressure reaches the
/// client.
async fn reader_task<S, E>(
    mut stream: S,
    events: InboundTx,
    closed: CancellationToken,
    conn_id: ConnectionId,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if events.send(parse_client_event(text.as_str())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                info!(conn_id = %conn_id, reason = ?frame, "client initiated close");
                break;
            }
            Ok(_) => { /* pings are answered by axum, binary frames ignored */ }
            Err(e) => {
                warn!(conn_id = %conn_id, "ws recv error: {e}");
                break;
            }
        }
    }
    closed.cancel();
}

/// Forward queued events to the socket. Returns the sink once every
/// sender is gone, or `None` if the socket broke first.
async fn writer_task(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    conn_id: ConnectionId,
) -> Option<WsSink> {
    while let Some(event) = rx.recv().await {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(conn_id = %conn_id, "{e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!(conn_id = %conn_id, "ws send error: {e}");
            return None;
        }
    }
    Some(sink)
}
