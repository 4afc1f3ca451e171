//! Postgres gateway for relayd.
//!
//! Uses sqlx with runtime-checked queries to avoid needing a live DB at
//! compile time.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{ConversationId, MembershipResolver, Message, MessageStore, StoreError};
use crate::auth::UserId;

const MIGRATION: &str = include_str!("../../migrations/001_init.sql");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Statements are `IF NOT EXISTS`, so this is safe on
    /// every restart.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lock the conversation row so appends to one conversation are
        // serialized and ids follow commit order.
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        let is_participant: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversation_participants
                WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(conversation_id)
        .bind(author_id)
        .fetch_one(&mut *tx)
        .await?;
        if !is_participant {
            return Err(StoreError::NotParticipant {
                conversation_id,
                user_id: author_id,
            });
        }

        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (conversation_id, author_id, content)
            VALUES ($1, $2, $3)
            RETURNING id, conversation_id, author_id, content, created_at
            "#,
        )
        .bind(conversation_id)
        .bind(author_id)
        .bind(content)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn history(&self, conversation_id: ConversationId) -> Result<Vec<Message>, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        let rows: Vec<Message> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, author_id, content, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl MembershipResolver for PgStore {
    async fn participants_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, StoreError> {
        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT c.id, p.user_id
            FROM conversations c
            LEFT JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE c.id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }
        Ok(rows.into_iter().filter_map(|(_, user_id)| user_id).collect())
    }
}
