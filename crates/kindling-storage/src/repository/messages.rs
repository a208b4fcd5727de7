//! Warmup message repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{CreateMessage, DeliveryCounts, SentUpdate, WarmupMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kindling_common::types::{AccountId, ConversationId, MessageStatus, WarmupMessageId};
use kindling_common::Result;
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert a message. Returns `None` if the (conversation, step) slot is taken.
    async fn create(&self, input: CreateMessage) -> Result<Option<WarmupMessage>>;

    async fn get(&self, id: WarmupMessageId) -> Result<Option<WarmupMessage>>;
    async fn get_by_step(
        &self,
        conversation_id: ConversationId,
        step: i32,
    ) -> Result<Option<WarmupMessage>>;
    async fn get_by_correlation(&self, correlation_id: Uuid) -> Result<Option<WarmupMessage>>;
    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<WarmupMessage>>;

    async fn mark_sent(&self, id: WarmupMessageId, update: SentUpdate) -> Result<()>;

    /// Record a failed send attempt on a queued message
    async fn record_failure(&self, id: WarmupMessageId, error: &str) -> Result<()>;

    async fn mark_bounced(&self, id: WarmupMessageId, reason: &str, at: DateTime<Utc>)
        -> Result<()>;

    /// Record where the message landed on the receiving side
    async fn mark_landed(&self, id: WarmupMessageId, in_spam: bool, at: DateTime<Utc>)
        -> Result<()>;

    async fn mark_opened(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()>;
    async fn mark_replied(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()>;
    async fn mark_archived(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()>;

    /// Accounts `account_id` exchanged a message with since `since`, in either direction
    async fn recent_partners(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccountId>>;

    /// Outcome counts over every message the account sent or received
    async fn delivery_counts(&self, account_id: AccountId) -> Result<DeliveryCounts>;
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn status_list(statuses: &[MessageStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: CreateMessage) -> Result<Option<WarmupMessage>> {
        let now = Utc::now();

        sqlx::query_as::<_, WarmupMessage>(
            r#"
            INSERT INTO messages (
                id, conversation_id, step, sender_id, receiver_id, template_id, subject, body,
                correlation_id, rfc_message_id, in_reply_to, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'queued', $12, $12)
            ON CONFLICT (conversation_id, step) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.conversation_id)
        .bind(input.step)
        .bind(input.sender_id)
        .bind(input.receiver_id)
        .bind(input.template_id)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(input.correlation_id)
        .bind(&input.rfc_message_id)
        .bind(&input.in_reply_to)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: WarmupMessageId) -> Result<Option<WarmupMessage>> {
        sqlx::query_as::<_, WarmupMessage>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_by_step(
        &self,
        conversation_id: ConversationId,
        step: i32,
    ) -> Result<Option<WarmupMessage>> {
        sqlx::query_as::<_, WarmupMessage>(
            "SELECT * FROM messages WHERE conversation_id = $1 AND step = $2",
        )
        .bind(conversation_id)
        .bind(step)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get_by_correlation(&self, correlation_id: Uuid) -> Result<Option<WarmupMessage>> {
        sqlx::query_as::<_, WarmupMessage>("SELECT * FROM messages WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<WarmupMessage>> {
        sqlx::query_as::<_, WarmupMessage>(
            "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY step",
        )
        .bind(conversation_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_sent(&self, id: WarmupMessageId, update: SentUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'sent', provider_message_id = $2, provider_thread_id = $3,
                sent_at = $4, error_message = NULL, updated_at = $4
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(&update.provider_message_id)
        .bind(&update.provider_thread_id)
        .bind(update.sent_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_failure(&self, id: WarmupMessageId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET error_message = $2, retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_bounced(
        &self,
        id: WarmupMessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'bounced', was_bounced = TRUE, bounced_at = $3, error_message = $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_landed(
        &self,
        id: WarmupMessageId,
        in_spam: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages SET
                landed_in_spam = landed_in_spam OR $2,
                landed_in_inbox = landed_in_inbox OR NOT $2,
                status = CASE
                    WHEN status IN ('sent', 'delivered') AND $2 THEN 'spam'
                    WHEN status = 'sent' THEN 'delivered'
                    ELSE status END,
                delivered_at = COALESCE(delivered_at, $3),
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(in_spam)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_opened(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages SET
                was_opened = TRUE,
                opened_at = COALESCE(opened_at, $2),
                status = CASE WHEN status IN ('sent', 'delivered') THEN 'opened' ELSE status END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_replied(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages SET
                was_replied = TRUE,
                replied_at = COALESCE(replied_at, $2),
                status = CASE WHEN status IN ('sent', 'delivered', 'opened', 'spam')
                    THEN 'replied' ELSE status END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_archived(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages SET status = 'archived', archived_at = $2, updated_at = $2
            WHERE id = $1 AND status <> 'bounced'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent_partners(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccountId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END
            FROM messages
            WHERE (sender_id = $1 OR receiver_id = $1) AND created_at >= $2
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delivery_counts(&self, account_id: AccountId) -> Result<DeliveryCounts> {
        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE receiver_id = $1 AND status = ANY($2)),
                COUNT(*) FILTER (WHERE receiver_id = $1 AND status = ANY($2) AND landed_in_inbox),
                COUNT(*) FILTER (WHERE receiver_id = $1 AND status = ANY($2) AND landed_in_spam),
                COUNT(*) FILTER (WHERE receiver_id = $1 AND status = ANY($2) AND was_opened),
                COUNT(*) FILTER (WHERE receiver_id = $1 AND status = ANY($2) AND was_replied),
                COUNT(*) FILTER (WHERE sender_id = $1 AND status = ANY($3)),
                COUNT(*) FILTER (WHERE sender_id = $1 AND status = ANY($3) AND was_bounced)
            FROM messages
            WHERE sender_id = $1 OR receiver_id = $1
            "#,
        )
        .bind(account_id)
        .bind(status_list(MessageStatus::DELIVERED_CLASS))
        .bind(status_list(MessageStatus::OUTBOUND_CLASS))
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(DeliveryCounts {
            inbound_total: row.0,
            inbox_landed: row.1,
            spam_landed: row.2,
            opened: row.3,
            replied: row.4,
            outbound_total: row.5,
            bounced: row.6,
        })
    }
}
