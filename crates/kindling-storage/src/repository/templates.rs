//! Template repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{CreateTemplate, Template, TemplateFilter};
use async_trait::async_trait;
use chrono::Utc;
use kindling_common::types::TemplateId;
use kindling_common::Result;
use uuid::Uuid;

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(&self, input: CreateTemplate) -> Result<Template>;

    /// Insert unless a template with the same category and subject exists
    async fn create_if_absent(&self, input: CreateTemplate) -> Result<Option<Template>>;

    async fn get(&self, id: TemplateId) -> Result<Option<Template>>;

    /// Active templates matching the filter
    async fn find(&self, filter: TemplateFilter) -> Result<Vec<Template>>;

    async fn increment_usage(&self, id: TemplateId) -> Result<()>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn create(&self, input: CreateTemplate) -> Result<Template> {
        sqlx::query_as::<_, Template>(
            r#"
            INSERT INTO templates (
                id, name, category, subject, body, language, is_initial,
                reply_to_template_id, variables, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(input.category.as_str())
        .bind(&input.subject)
        .bind(&input.body)
        .bind(&input.language)
        .bind(input.is_initial)
        .bind(input.reply_to_template_id)
        .bind(&input.variables)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn create_if_absent(&self, input: CreateTemplate) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>(
            r#"
            INSERT INTO templates (
                id, name, category, subject, body, language, is_initial,
                reply_to_template_id, variables, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (category, subject) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(input.category.as_str())
        .bind(&input.subject)
        .bind(&input.body)
        .bind(&input.language)
        .bind(input.is_initial)
        .bind(input.reply_to_template_id)
        .bind(&input.variables)
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find(&self, filter: TemplateFilter) -> Result<Vec<Template>> {
        sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM templates
            WHERE is_active
              AND ($1::BOOLEAN IS NULL OR is_initial = $1)
              AND ($2::TEXT IS NULL OR category = $2)
              AND ($3::TEXT IS NULL OR language = $3)
            ORDER BY created_at
            "#,
        )
        .bind(filter.is_initial)
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.language)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn increment_usage(&self, id: TemplateId) -> Result<()> {
        sqlx::query("UPDATE templates SET usage_count = usage_count + 1 WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
