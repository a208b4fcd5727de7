//! Conversation repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{Conversation, CreateConversation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kindling_common::types::{ConversationId, ConversationStatus};
use kindling_common::Result;
use uuid::Uuid;

/// Conversation repository trait
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, input: CreateConversation) -> Result<Conversation>;
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>>;
    async fn list_by_status(&self, status: ConversationStatus, limit: i64)
        -> Result<Vec<Conversation>>;

    /// Move `current_step` from `from_step` to `from_step + 1` if the
    /// conversation is still active and at that step. Reaching `max_steps`
    /// flips the status to completed in the same update. Returns the
    /// updated row, or `None` when nothing changed.
    async fn advance(
        &self,
        id: ConversationId,
        from_step: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<Conversation>>;

    /// Active -> error. Returns false if the conversation was not active.
    async fn mark_error(&self, id: ConversationId, reason: &str) -> Result<bool>;

    /// Completed -> archived. Returns false if the conversation was not completed.
    async fn mark_archived(&self, id: ConversationId, at: DateTime<Utc>) -> Result<bool>;
}

/// Database conversation repository
pub struct DbConversationRepository {
    pool: DatabasePool,
}

impl DbConversationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn create(&self, input: CreateConversation) -> Result<Conversation> {
        let now = Utc::now();

        sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (
                id, sender_id, receiver_id, thread_id, subject, template_id,
                current_step, max_steps, status, started_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, 'active', $8, $8, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.sender_id)
        .bind(input.receiver_id)
        .bind(&input.thread_id)
        .bind(&input.subject)
        .bind(input.template_id)
        .bind(input.max_steps)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_status(
        &self,
        status: ConversationStatus,
        limit: i64,
    ) -> Result<Vec<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE status = $1 ORDER BY updated_at LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn advance(
        &self,
        id: ConversationId,
        from_step: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            r#"
            UPDATE conversations SET
                current_step = current_step + 1,
                last_reply_at = $3,
                status = CASE WHEN current_step + 1 >= max_steps THEN 'completed' ELSE status END,
                completed_at = CASE WHEN current_step + 1 >= max_steps THEN $3 ELSE completed_at END,
                updated_at = $3
            WHERE id = $1
              AND current_step = $2
              AND current_step < max_steps
              AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from_step)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_error(&self, id: ConversationId, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET status = 'error', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_archived(&self, id: ConversationId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET status = 'archived', archived_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'completed'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }
}
