//! Daily quota and gradual ramp
//!
//! The daily cap is enforced by an atomic reservation in the account
//! repository; this module holds the eligibility rule, the ramp schedule and
//! the two recurring maintenance passes.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use kindling_common::types::{AccountId, AccountStatus};
use kindling_common::{Error, Result};
use kindling_storage::{Account, AccountRepository};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Daily send cap in force for the account
pub fn current_limit(account: &Account) -> i32 {
    account.current_limit()
}

/// Active, warmup enabled and below today's cap. A counter last reset
/// before `today` counts as zero.
pub fn is_eligible(account: &Account, today: NaiveDate) -> bool {
    account.status_enum() == Some(AccountStatus::Active)
        && account.warmup_enabled
        && account.sent_today(today) < account.current_limit()
}

/// Where an account sits on its ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStep {
    /// Still ramping at this volume
    Ramping(i32),
    /// Duration elapsed; volume is the target and the ramp switches off
    Finished(i32),
}

/// Linear ramp from `start` to `target` over `weeks`
pub fn ramp_volume(start: i32, target: i32, weeks: i32, elapsed_days: i64) -> RampStep {
    let duration_days = i64::from(weeks.max(0)) * 7;
    if elapsed_days >= duration_days {
        return RampStep::Finished(target);
    }

    let daily = f64::from(target - start) / duration_days as f64;
    let volume = i64::from(start) + (daily * elapsed_days.max(0) as f64).floor() as i64;
    RampStep::Ramping(volume.min(i64::from(target)) as i32)
}

/// Outcome of a ramp adjustment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RampSummary {
    pub started: u32,
    pub adjusted: u32,
    pub finished: u32,
    pub failed: u32,
}

/// Quota reservation and the daily maintenance passes
pub struct QuotaEnforcer {
    accounts: Arc<dyn AccountRepository>,
}

impl QuotaEnforcer {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self { accounts }
    }

    /// Reserve one send for today, or report the deferral
    pub async fn reserve(&self, account_id: AccountId, today: NaiveDate) -> Result<()> {
        if self.accounts.try_reserve_send(account_id, today).await? {
            Ok(())
        } else {
            debug!(account_id = %account_id, "Daily quota exhausted");
            Err(Error::QuotaDeferred(account_id))
        }
    }

    /// Undo a reservation whose send did not go out
    pub async fn release(&self, account_id: AccountId, today: NaiveDate) {
        if let Err(e) = self.accounts.release_send(account_id, today).await {
            warn!(account_id = %account_id, error = %e, "Failed to release send reservation");
        }
    }

    /// Zero the daily counters left over from previous days
    pub async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64> {
        let reset = self.accounts.reset_daily_counters(today).await?;
        info!(reset, %today, "Daily counters reset");
        Ok(reset)
    }

    /// Move every active ramping account along its schedule
    pub async fn adjust_gradual_volume(&self, now: DateTime<Utc>) -> Result<RampSummary> {
        let today = now.date_naive();
        let mut summary = RampSummary::default();

        for account in self.accounts.list_ramping().await? {
            if account.status_enum() != Some(AccountStatus::Active) {
                continue;
            }
            match self.adjust_one(&account, today).await {
                Ok(Some(RampChange::Started)) => summary.started += 1,
                Ok(Some(RampChange::Adjusted)) => summary.adjusted += 1,
                Ok(Some(RampChange::Finished)) => summary.finished += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Ramp adjustment failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            started = summary.started,
            adjusted = summary.adjusted,
            finished = summary.finished,
            "Gradual volume adjustment complete"
        );
        Ok(summary)
    }

    async fn adjust_one(&self, account: &Account, today: NaiveDate) -> Result<Option<RampChange>> {
        let Some(start_date) = account.gradual_start_date else {
            self.accounts
                .update_ramp(account.id, Some(account.gradual_start_volume), Some(today), true)
                .await?;
            return Ok(Some(RampChange::Started));
        };

        let elapsed = (today - start_date).num_days();
        match ramp_volume(
            account.gradual_start_volume,
            account.gradual_target_volume,
            account.gradual_duration_weeks,
            elapsed,
        ) {
            RampStep::Finished(target) => {
                self.accounts
                    .update_ramp(account.id, Some(target), Some(start_date), false)
                    .await?;
                info!(email = %account.email, volume = target, "Gradual increase completed");
                Ok(Some(RampChange::Finished))
            }
            RampStep::Ramping(volume) if account.gradual_current_volume != Some(volume) => {
                self.accounts
                    .update_ramp(account.id, Some(volume), Some(start_date), true)
                    .await?;
                debug!(email = %account.email, volume, elapsed, "Gradual volume adjusted");
                Ok(Some(RampChange::Adjusted))
            }
            RampStep::Ramping(_) => Ok(None),
        }
    }
}

enum RampChange {
    Started,
    Adjusted,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kindling_common::types::{ConnectionType, Provider};
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::CreateAccount;
    use pretty_assertions::assert_eq;

    async fn account(store: &MemoryStore, email: &str) -> Account {
        AccountRepository::create(store, CreateAccount::new(email, Provider::Custom, ConnectionType::Smtp))
            .await
            .unwrap()
    }

    #[test]
    fn test_ramp_midpoint_and_end() {
        assert_eq!(ramp_volume(5, 100, 4, 0), RampStep::Ramping(5));
        assert_eq!(ramp_volume(5, 100, 4, 14), RampStep::Ramping(52));
        assert_eq!(ramp_volume(5, 100, 4, 27), RampStep::Ramping(96));
        assert_eq!(ramp_volume(5, 100, 4, 28), RampStep::Finished(100));
        assert_eq!(ramp_volume(5, 100, 4, 90), RampStep::Finished(100));
    }

    #[tokio::test]
    async fn test_eligibility_respects_limit_and_reset_date() {
        let store = MemoryStore::new();
        let created = account(&store, "a@example.com").await;
        let today = Utc::now().date_naive();

        store.update_account(created.id, |a| {
            a.emails_per_day = 20;
            a.daily_emails_sent = 20;
            a.last_reset_date = today;
        });
        let full = AccountRepository::get(&store, created.id).await.unwrap().unwrap();
        assert!(!is_eligible(&full, today));

        store.update_account(created.id, |a| a.last_reset_date = today - Duration::days(1));
        let stale = AccountRepository::get(&store, created.id).await.unwrap().unwrap();
        assert!(is_eligible(&stale, today));

        store.update_account(created.id, |a| a.warmup_enabled = false);
        let disabled = AccountRepository::get(&store, created.id).await.unwrap().unwrap();
        assert!(!is_eligible(&disabled, today));
    }

    #[tokio::test]
    async fn test_reserve_defers_at_cap() {
        let store = Arc::new(MemoryStore::new());
        let created = account(&store, "a@example.com").await;
        store.update_account(created.id, |a| a.emails_per_day = 2);
        let quota = QuotaEnforcer::new(store.clone());
        let today = Utc::now().date_naive();

        quota.reserve(created.id, today).await.unwrap();
        quota.reserve(created.id, today).await.unwrap();
        assert!(matches!(
            quota.reserve(created.id, today).await,
            Err(Error::QuotaDeferred(id)) if id == created.id
        ));

        quota.release(created.id, today).await;
        quota.reserve(created.id, today).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let store = Arc::new(MemoryStore::new());
        let created = account(&store, "a@example.com").await;
        store.update_account(created.id, |a| a.emails_per_day = 5);
        let quota = Arc::new(QuotaEnforcer::new(store.clone()));
        let today = Utc::now().date_naive();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move { quota.reserve(created.id, today).await })
            })
            .collect();

        let mut reserved = 0;
        let mut deferred = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => reserved += 1,
                Err(Error::QuotaDeferred(id)) if id == created.id => deferred += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((reserved, deferred), (5, 15));

        let after = AccountRepository::get(store.as_ref(), created.id).await.unwrap().unwrap();
        assert_eq!(after.daily_emails_sent, 5);
        assert_eq!(after.sent_today(today), after.current_limit());
    }

    #[tokio::test]
    async fn test_reserve_for_missing_account_is_not_found() {
        let quota = QuotaEnforcer::new(Arc::new(MemoryStore::new()));
        let err = quota
            .reserve(uuid::Uuid::new_v4(), Utc::now().date_naive())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_adjust_starts_moves_and_finishes_ramps() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let today = now.date_naive();

        let fresh = account(&store, "fresh@example.com").await;
        let midway = account(&store, "midway@example.com").await;
        let done = account(&store, "done@example.com").await;
        for (id, start) in [
            (fresh.id, None),
            (midway.id, Some(today - Duration::days(14))),
            (done.id, Some(today - Duration::days(30))),
        ] {
            store.update_account(id, |a| {
                a.use_gradual_increase = true;
                a.gradual_start_volume = 5;
                a.gradual_target_volume = 100;
                a.gradual_duration_weeks = 4;
                a.gradual_start_date = start;
                a.gradual_current_volume = start.map(|_| 5);
            });
        }

        let summary = QuotaEnforcer::new(store.clone())
            .adjust_gradual_volume(now)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RampSummary {
                started: 1,
                adjusted: 1,
                finished: 1,
                failed: 0
            }
        );

        let fresh = AccountRepository::get(store.as_ref(), fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.gradual_start_date, Some(today));
        assert_eq!(fresh.current_limit(), 5);

        let midway = AccountRepository::get(store.as_ref(), midway.id).await.unwrap().unwrap();
        assert_eq!(midway.gradual_current_volume, Some(52));
        assert_eq!(midway.current_limit(), 52);

        let done = AccountRepository::get(store.as_ref(), done.id).await.unwrap().unwrap();
        assert_eq!(done.gradual_current_volume, Some(100));
        assert!(!done.use_gradual_increase);
    }
}
