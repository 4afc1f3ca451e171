//! Error types for relayd.
//!
//! Every failure is scoped to one connection or one send attempt; nothing
//! here is fatal to the process.

use crate::auth::AuthError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid event: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[source] StoreError),

    /// The message was persisted but its participants could not be resolved.
    #[error("message {message_id} stored but delivery could not be confirmed: {source}")]
    Membership {
        message_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("not a participant of conversation {0}")]
    NotParticipant(i64),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Text for the `reason` field of an outbound error event.
    ///
    /// Storage internals stay in the server log; the client only learns
    /// which class of failure happened.
    pub fn reason(&self) -> String {
        match self {
            RelayError::Auth(_) => "authentication error".into(),
            RelayError::Validation(msg) => msg.clone(),
            RelayError::Storage(StoreError::ConversationNotFound(id)) => {
                format!("conversation {id} not found")
            }
            RelayError::Storage(StoreError::NotParticipant { conversation_id, .. }) => {
                format!("not a participant of conversation {conversation_id}")
            }
            RelayError::Storage(_) => "failed to send message".into(),
            RelayError::Membership { message_id, .. } => {
                format!("message {message_id} saved but delivery could not be confirmed")
            }
            RelayError::NotParticipant(id) => format!("not a participant of conversation {id}"),
            RelayError::Protocol(msg) => msg.clone(),
        }
    }
}
