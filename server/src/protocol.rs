//! Wire protocol types.
//!
//! Covers: auth, sendMessage, history (client → server) and
//! authenticated, message, history, error (server → client).
//! Frames are JSON text with a `type` tag.

use serde::{Deserialize, Serialize};

use crate::auth::{Identity, UserId};
use crate::error::RelayError;
use crate::registry::ConnectionId;
use crate::store::{ConversationId, Message};

// ═══════════════════════════════════════════════════════════════
// Client → Server
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope from client, dispatched on `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    Auth(AuthMsg),
    SendMessage(SendMessageMsg),
    History(HistoryMsg),
}

/// Handshake payload.
#[derive(Debug, Deserialize)]
pub struct AuthMsg {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageMsg {
    #[serde(default)]
    pub conversation_id: RawConversationId,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMsg {
    #[serde(default)]
    pub conversation_id: RawConversationId,
}

/// Conversation id exactly as the client sent it. Any JSON value is
/// accepted here so that a malformed id is reported by [`resolve`] as a
/// validation failure rather than an unparseable frame.
///
/// [`resolve`]: RawConversationId::resolve
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RawConversationId(serde_json::Value);

impl RawConversationId {
    /// Accepts an integer or a string holding one (surrounding whitespace
    /// ignored).
    pub fn resolve(&self) -> Result<ConversationId, RelayError> {
        use serde_json::Value;

        match &self.0 {
            Value::Number(n) => n.as_i64().ok_or_else(|| {
                RelayError::Validation(format!("invalid conversation id: {n}"))
            }),
            Value::String(s) => s.trim().parse().map_err(|_| {
                RelayError::Validation(format!("invalid conversation id: {s:?}"))
            }),
            Value::Null => Err(RelayError::Validation("missing conversation id".into())),
            other => Err(RelayError::Validation(format!(
                "invalid conversation id: {other}"
            ))),
        }
    }
}

/// A send request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEvent {
    pub conversation_id: ConversationId,
    pub content: String,
}

impl SendMessageMsg {
    /// Validate into a [`SendEvent`]. Content is stored as sent; only the
    /// emptiness check looks at the trimmed form.
    pub fn validate(self, max_len: usize) -> Result<SendEvent, RelayError> {
        let conversation_id = self.conversation_id.resolve()?;
        if self.content.trim().is_empty() {
            return Err(RelayError::Validation("message content is empty".into()));
        }
        if self.content.chars().count() > max_len {
            return Err(RelayError::Validation(format!(
                "message content exceeds {max_len} characters"
            )));
        }
        Ok(SendEvent {
            conversation_id,
            content: self.content,
        })
    }
}

/// Parse one text frame.
pub fn parse_client_event(text: &str) -> Result<ClientEvent, RelayError> {
    serde_json::from_str(text).map_err(|e| RelayError::Protocol(format!("invalid event: {e}")))
}

// ═══════════════════════════════════════════════════════════════
// Server → Client
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Authenticated(AuthenticatedMsg),
    Message(Message),
    History(HistoryResultMsg),
    Error(ErrorMsg),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMsg {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResultMsg {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMsg {
    pub reason: String,
}

impl ServerEvent {
    pub fn authenticated(identity: &Identity, connection_id: ConnectionId) -> Self {
        ServerEvent::Authenticated(AuthenticatedMsg {
            user_id: identity.user_id,
            username: identity.username.clone(),
            connection_id,
        })
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorMsg {
            reason: reason.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Protocol(format!("serialize error: {e}")))
    }
}

impl From<&RelayError> for ServerEvent {
    fn from(err: &RelayError) -> Self {
        ServerEvent::error(err.reason())
    }
}
