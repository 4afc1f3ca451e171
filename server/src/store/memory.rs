//! In-process store for development runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{ConversationId, MembershipResolver, Message, MessageStore, StoreError};
use crate::auth::UserId;

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<ConversationId, HashSet<UserId>>,
    messages: Vec<Message>,
    next_conversation_id: ConversationId,
    next_message_id: i64,
}

/// Conversations and messages held in memory. Ids are assigned from
/// monotonically increasing counters, so messages of one conversation get
/// strictly increasing ids.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a conversation with the given participants and return its id.
    pub fn create_conversation(&self, participants: &[UserId]) -> ConversationId {
        let mut inner = self.lock();
        inner.next_conversation_id += 1;
        let id = inner.next_conversation_id;
        inner
            .conversations
            .insert(id, participants.iter().copied().collect());
        id
    }

    /// Create a conversation under a caller-chosen id, replacing any
    /// existing participants.
    pub fn insert_conversation(&self, id: ConversationId, participants: &[UserId]) {
        let mut inner = self.lock();
        inner.next_conversation_id = inner.next_conversation_id.max(id);
        inner
            .conversations
            .insert(id, participants.iter().copied().collect());
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another task panicked mid-update;
        // every update leaves Inner consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut inner = self.lock();
        let participants = inner
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        if !participants.contains(&author_id) {
            return Err(StoreError::NotParticipant {
                conversation_id,
                user_id: author_id,
            });
        }

        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            conversation_id,
            author_id,
            content: content.to_owned(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn history(&self, conversation_id: ConversationId) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MembershipResolver for MemoryStore {
    async fn participants_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, StoreError> {
        self.lock()
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::ConversationNotFound(conversation_id))
    }
}
