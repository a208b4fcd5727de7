//! Audit event repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{AuditEvent, NewAuditEvent};
use async_trait::async_trait;
use chrono::Utc;
use kindling_common::Result;
use uuid::Uuid;

/// Append-only audit sink
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, event: NewAuditEvent) -> Result<()>;
    async fn list_for_entity(
        &self,
        entity: &str,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditEvent>>;
}

/// Database audit repository
pub struct DbAuditRepository {
    pool: DatabasePool,
}

impl DbAuditRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for DbAuditRepository {
    async fn append(&self, event: NewAuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, action, entity, entity_id, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&event.action)
        .bind(&event.entity)
        .bind(event.entity_id)
        .bind(&event.details)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity: &str,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT * FROM audit_events
            WHERE entity = $1 AND entity_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(entity)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
