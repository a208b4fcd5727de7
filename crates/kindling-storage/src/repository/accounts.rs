//! Account repository

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{Account, CreateAccount, LiveHealth};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kindling_common::types::{AccountId, AccountStatus};
use kindling_common::{Error, Result};
use uuid::Uuid;

/// Account repository trait
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create(&self, input: CreateAccount) -> Result<Account>;
    async fn get(&self, id: AccountId) -> Result<Option<Account>>;
    async fn get_by_email(&self, email: &str) -> Result<Option<Account>>;
    async fn list(&self) -> Result<Vec<Account>>;
    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>>;

    /// Active accounts with warmup enabled, regardless of quota
    async fn list_warmup_candidates(&self) -> Result<Vec<Account>>;

    /// Accounts with the gradual ramp enabled
    async fn list_ramping(&self) -> Result<Vec<Account>>;

    /// Atomically count one send against `today`. Rolls a stale counter
    /// over first. Returns false when the account is at its limit and
    /// `NotFound` when there is no such account.
    async fn try_reserve_send(&self, id: AccountId, today: NaiveDate) -> Result<bool>;

    /// Give back a reservation whose send did not go out
    async fn release_send(&self, id: AccountId, today: NaiveDate) -> Result<()>;

    /// Lifetime sent counters after a successful send
    async fn record_sent(&self, id: AccountId, is_reply: bool) -> Result<()>;

    /// Daily and lifetime received counters
    async fn record_received(&self, id: AccountId, today: NaiveDate) -> Result<()>;

    /// Zero the daily counters of every account whose reset date is before `today`
    async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64>;

    async fn update_ramp(
        &self,
        id: AccountId,
        current_volume: Option<i32>,
        start_date: Option<NaiveDate>,
        enabled: bool,
    ) -> Result<()>;

    async fn update_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    async fn record_connection_test(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
        tested_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_warmup_enabled(
        &self,
        id: AccountId,
        enabled: bool,
        status: AccountStatus,
    ) -> Result<()>;

    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn update_health(
        &self,
        id: AccountId,
        live: LiveHealth,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, id: AccountId) -> Result<()>;
}

/// Database account repository
pub struct DbAccountRepository {
    pool: DatabasePool,
}

impl DbAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const LIMIT_EXPR: &str = "CASE WHEN use_gradual_increase \
    THEN COALESCE(gradual_current_volume, gradual_start_volume) \
    ELSE emails_per_day END";

#[async_trait]
impl AccountRepository for DbAccountRepository {
    async fn create(&self, input: CreateAccount) -> Result<Account> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (
                id, email, display_name, provider, connection_type, credentials, token_expires_at,
                status, warmup_enabled, emails_per_day, use_gradual_increase,
                gradual_start_volume, gradual_target_volume, gradual_duration_weeks,
                last_reset_date, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', TRUE, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.email)
        .bind(&input.display_name)
        .bind(input.provider.as_str())
        .bind(input.connection_type.as_str())
        .bind(&input.credentials)
        .bind(input.token_expires_at)
        .bind(input.emails_per_day)
        .bind(input.use_gradual_increase)
        .bind(input.gradual_start_volume)
        .bind(input.gradual_target_volume)
        .bind(input.gradual_duration_weeks)
        .bind(now.date_naive())
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::Validation(format!("Account {} is already enrolled", input.email))
            }
            other => db_err(other),
        })
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_warmup_candidates(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE status = 'active' AND warmup_enabled ORDER BY created_at",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_ramping(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE use_gradual_increase")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn try_reserve_send(&self, id: AccountId, today: NaiveDate) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE accounts SET
                daily_emails_sent = CASE WHEN last_reset_date < $2 THEN 1 ELSE daily_emails_sent + 1 END,
                daily_emails_received = CASE WHEN last_reset_date < $2 THEN 0 ELSE daily_emails_received END,
                last_reset_date = GREATEST(last_reset_date, $2),
                updated_at = NOW()
            WHERE id = $1
              AND (CASE WHEN last_reset_date < $2 THEN 0 ELSE daily_emails_sent END) < ({})
            "#,
            LIMIT_EXPR
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(today)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
            .bind(id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(db_err)?;
        if exists {
            Ok(false)
        } else {
            Err(Error::not_found("account", id))
        }
    }

    async fn release_send(&self, id: AccountId, today: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET daily_emails_sent = GREATEST(daily_emails_sent - 1, 0), updated_at = NOW()
            WHERE id = $1 AND last_reset_date = $2
            "#,
        )
        .bind(id)
        .bind(today)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_sent(&self, id: AccountId, is_reply: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET total_sent = total_sent + 1,
                replies_sent = replies_sent + CASE WHEN $2 THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(is_reply)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_received(&self, id: AccountId, today: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts SET
                daily_emails_received = CASE WHEN last_reset_date < $2 THEN 1 ELSE daily_emails_received + 1 END,
                daily_emails_sent = CASE WHEN last_reset_date < $2 THEN 0 ELSE daily_emails_sent END,
                last_reset_date = GREATEST(last_reset_date, $2),
                total_received = total_received + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(today)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET daily_emails_sent = 0, daily_emails_received = 0, last_reset_date = $1, updated_at = NOW()
            WHERE last_reset_date < $1
            "#,
        )
        .bind(today)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn update_ramp(
        &self,
        id: AccountId,
        current_volume: Option<i32>,
        start_date: Option<NaiveDate>,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET gradual_current_volume = $2, gradual_start_date = $3, use_gradual_increase = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(current_volume)
        .bind(start_date)
        .bind(enabled)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET status = $2, last_error = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_connection_test(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = $2, last_error = $3, last_tested_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .bind(tested_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_warmup_enabled(
        &self,
        id: AccountId,
        enabled: bool,
        status: AccountStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET warmup_enabled = $2, status = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(enabled)
        .bind(status.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts SET credentials = $2, token_expires_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(credentials)
        .bind(token_expires_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_health(
        &self,
        id: AccountId,
        live: LiveHealth,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET health_score = $2, inbox_rate = $3, spam_rate = $4, open_rate = $5,
                reply_rate = $6, bounce_rate = $7, health_updated_at = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(live.health_score)
        .bind(live.inbox_rate)
        .bind(live.spam_rate)
        .bind(live.open_rate)
        .bind(live.reply_rate)
        .bind(live.bounce_rate)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
