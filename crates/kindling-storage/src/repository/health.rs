//! Health snapshot repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{HealthSnapshot, NewHealthSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use kindling_common::types::AccountId;
use kindling_common::Result;
use uuid::Uuid;

/// Health snapshot repository trait. Snapshots are append-only.
#[async_trait]
pub trait HealthRepository: Send + Sync {
    async fn append(&self, input: NewHealthSnapshot) -> Result<HealthSnapshot>;
    async fn history(&self, account_id: AccountId, limit: i64) -> Result<Vec<HealthSnapshot>>;
}

/// Database health snapshot repository
pub struct DbHealthRepository {
    pool: DatabasePool,
}

impl DbHealthRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthRepository for DbHealthRepository {
    async fn append(&self, input: NewHealthSnapshot) -> Result<HealthSnapshot> {
        sqlx::query_as::<_, HealthSnapshot>(
            r#"
            INSERT INTO health_snapshots (
                id, account_id, health_score, inbox_rate, spam_rate, open_rate, reply_rate,
                bounce_rate, inbound_sample, outbound_sample, total_sent, total_received, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.account_id)
        .bind(input.live.health_score)
        .bind(input.live.inbox_rate)
        .bind(input.live.spam_rate)
        .bind(input.live.open_rate)
        .bind(input.live.reply_rate)
        .bind(input.live.bounce_rate)
        .bind(input.inbound_sample)
        .bind(input.outbound_sample)
        .bind(input.total_sent)
        .bind(input.total_received)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn history(&self, account_id: AccountId, limit: i64) -> Result<Vec<HealthSnapshot>> {
        sqlx::query_as::<_, HealthSnapshot>(
            r#"
            SELECT * FROM health_snapshots
            WHERE account_id = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
