//! Job queue repository
//!
//! Jobs live in a single table and are claimed with `FOR UPDATE SKIP LOCKED`,
//! so any number of workers can poll the same queue. Delays are expressed as
//! a future `scheduled_at`.

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{Job, JobStats, NewJob, NewRecurringJob, RecurringJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kindling_common::types::JobId;
use kindling_common::Result;
use uuid::Uuid;

/// Job repository trait
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job. Returns `None` if another job already holds the dedupe key.
    async fn enqueue(&self, job: NewJob) -> Result<Option<Job>>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Claim up to `limit` due jobs of `queue`, marking them processing
    async fn claim_due(&self, queue: &str, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    async fn complete(&self, id: JobId, at: DateTime<Utc>) -> Result<()>;

    /// Back to pending with a new attempt count and release time
    async fn retry(
        &self,
        id: JobId,
        attempts: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Back to pending without consuming an attempt
    async fn defer(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()>;

    /// Terminal failure. The row is kept for inspection.
    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()>;

    /// Release jobs a crashed worker left in processing
    async fn release_stale(&self, started_before: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self, queue: &str) -> Result<JobStats>;
    async fn list_failed(&self, queue: &str, limit: i64) -> Result<Vec<Job>>;

    /// Insert a recurring definition unless one with the same name exists
    async fn register_recurring(&self, job: NewRecurringJob) -> Result<bool>;

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>>;

    /// Compare-and-set `next_run_at`; only one caller wins an occurrence
    async fn advance_recurring(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Database job repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn enqueue(&self, job: NewJob) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, queue, name, payload, status, attempts, max_attempts,
                              dedupe_key, scheduled_at, created_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $8)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.queue)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(&job.dedupe_key)
        .bind(job.scheduled_at)
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn claim_due(&self, queue: &str, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET status = 'processing', started_at = $2
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND status = 'pending' AND scheduled_at <= $2
                ORDER BY scheduled_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn complete(&self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = $2
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

    async fn retry(
        &self,
        id: JobId,
        attempts: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = $2,
                last_error = $3,
                scheduled_at = $4,
                started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(run_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn defer(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                deferrals = deferrals + 1,
                last_error = $2,
                scheduled_at = $3,
                started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(run_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', attempts = $2, last_error = $3, completed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn release_stale(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', started_at = NULL
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, queue: &str) -> Result<JobStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn list_failed(&self, queue: &str, limit: i64) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE queue = $1 AND status = 'failed'
            ORDER BY completed_at DESC
            LIMIT $2
            "#,
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn register_recurring(&self, job: NewRecurringJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO recurring_jobs (name, queue, payload, schedule, next_run_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&job.name)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(&job.schedule)
        .bind(job.next_run_at)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        sqlx::query_as::<_, RecurringJob>(
            "SELECT * FROM recurring_jobs WHERE next_run_at <= $1 ORDER BY next_run_at",
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_jobs SET next_run_at = $3, last_run_at = $4
            WHERE name = $1 AND next_run_at = $2
            "#,
        )
        .bind(name)
        .bind(expected_next)
        .bind(next)
        .bind(fired_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}
