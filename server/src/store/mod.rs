//! Message Store Gateway and Conversation Membership Resolver.
//!
//! The relay only talks to durable storage through these two traits.
//! `pg` is the Postgres implementation used in production, `memory` backs
//! development runs and tests.

pub mod memory;
pub mod pg;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::UserId;

pub type ConversationId = i64;

/// A persisted chat message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable message storage. Implementations assign `id` and `created_at`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// All messages of a conversation in persistence order.
    async fn history(&self, conversation_id: ConversationId) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn participants_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, StoreError>;
}
