//! Health score calculator and deliverability tracker

use std::sync::Arc;

use chrono::Utc;
use kindling_common::types::{AccountId, AccountStatus, WarmupMessageId};
use kindling_common::{Error, Result};
use kindling_storage::{
    AccountRepository, DeliveryCounts, HealthRepository, HealthSnapshot, LiveHealth,
    MessageRepository, NewHealthSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The five component rates, as percentages
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthRates {
    pub inbox_rate: f64,
    pub spam_rate: f64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCategory {
    Excellent,
    Good,
    Average,
    Poor,
    Critical,
}

impl HealthCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthCategory::Excellent
        } else if score >= 75.0 {
            HealthCategory::Good
        } else if score >= 60.0 {
            HealthCategory::Average
        } else if score >= 40.0 {
            HealthCategory::Poor
        } else {
            HealthCategory::Critical
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HealthCategory::Excellent => "Excellent",
            HealthCategory::Good => "Good",
            HealthCategory::Average => "Average",
            HealthCategory::Poor => "Poor",
            HealthCategory::Critical => "Critical",
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        round2(part as f64 / total as f64 * 100.0)
    }
}

/// Weighted score in `[0, 100]`, rounded to two decimals
pub fn calculate_health_score(rates: &HealthRates) -> f64 {
    let score = rates.inbox_rate * 0.35
        + rates.open_rate * 0.25
        + rates.reply_rate * 0.20
        + (100.0 - rates.spam_rate) * 0.15
        + (100.0 - rates.bounce_rate) * 0.05;
    round2(score.clamp(0.0, 100.0))
}

/// Rates from raw outcome counts; an empty denominator gives 0
pub fn compute_rates(counts: &DeliveryCounts) -> HealthRates {
    HealthRates {
        inbox_rate: percent(counts.inbox_landed, counts.inbound_total),
        spam_rate: percent(counts.spam_landed, counts.inbound_total),
        open_rate: percent(counts.opened, counts.inbound_total),
        reply_rate: percent(counts.replied, counts.inbound_total),
        bounce_rate: percent(counts.bounced, counts.outbound_total),
    }
}

/// Result of a recompute-all pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeSummary {
    pub updated: u32,
    pub failed: u32,
}

/// Platform-wide aggregate over active accounts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformStats {
    pub accounts: u64,
    pub average_score: f64,
    pub excellent: u64,
    pub good: u64,
    pub average: u64,
    pub poor: u64,
    pub critical: u64,
}

pub struct HealthCalculator {
    accounts: Arc<dyn AccountRepository>,
    messages: Arc<dyn MessageRepository>,
    snapshots: Arc<dyn HealthRepository>,
}

impl HealthCalculator {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        messages: Arc<dyn MessageRepository>,
        snapshots: Arc<dyn HealthRepository>,
    ) -> Self {
        Self {
            accounts,
            messages,
            snapshots,
        }
    }

    /// Recompute one account from its full message history, append a
    /// snapshot and overwrite the live fields
    pub async fn recompute(&self, account_id: AccountId) -> Result<HealthSnapshot> {
        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| Error::not_found("account", account_id))?;

        let counts = self.messages.delivery_counts(account_id).await?;
        let rates = compute_rates(&counts);
        let live = LiveHealth {
            health_score: calculate_health_score(&rates),
            inbox_rate: rates.inbox_rate,
            spam_rate: rates.spam_rate,
            open_rate: rates.open_rate,
            reply_rate: rates.reply_rate,
            bounce_rate: rates.bounce_rate,
        };

        let snapshot = self
            .snapshots
            .append(NewHealthSnapshot {
                account_id,
                live,
                inbound_sample: counts.inbound_total,
                outbound_sample: counts.outbound_total,
                total_sent: account.total_sent,
                total_received: account.total_received,
            })
            .await?;
        self.accounts.update_health(account_id, live, snapshot.recorded_at).await?;

        debug!(
            email = %account.email,
            score = live.health_score,
            category = HealthCategory::from_score(live.health_score).label(),
            "Health score updated"
        );
        Ok(snapshot)
    }

    /// Recompute every account; one failure never stops the rest
    pub async fn recompute_all(&self) -> Result<RecomputeSummary> {
        let mut summary = RecomputeSummary::default();
        for account in self.accounts.list().await? {
            match self.recompute(account.id).await {
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Health recompute failed");
                    summary.failed += 1;
                }
            }
        }

        info!(updated = summary.updated, failed = summary.failed, "Health scores updated");
        Ok(summary)
    }

    pub async fn history(&self, account_id: AccountId, limit: i64) -> Result<Vec<HealthSnapshot>> {
        self.snapshots.history(account_id, limit).await
    }

    /// Mean score and category counts from the live fields of active accounts
    pub async fn platform_stats(&self) -> Result<PlatformStats> {
        let accounts = self.accounts.list_by_status(AccountStatus::Active).await?;
        let mut stats = PlatformStats::default();
        let mut total = 0.0;

        for account in &accounts {
            total += account.health_score;
            match HealthCategory::from_score(account.health_score) {
                HealthCategory::Excellent => stats.excellent += 1,
                HealthCategory::Good => stats.good += 1,
                HealthCategory::Average => stats.average += 1,
                HealthCategory::Poor => stats.poor += 1,
                HealthCategory::Critical => stats.critical += 1,
            }
        }

        stats.accounts = accounts.len() as u64;
        if !accounts.is_empty() {
            stats.average_score = round2(total / accounts.len() as f64);
        }
        Ok(stats)
    }
}

/// Records the externally observed outcome of a message
pub struct DeliverabilityTracker {
    messages: Arc<dyn MessageRepository>,
}

impl DeliverabilityTracker {
    pub fn new(messages: Arc<dyn MessageRepository>) -> Self {
        Self { messages }
    }

    async fn ensure_exists(&self, id: WarmupMessageId) -> Result<()> {
        match self.messages.get(id).await? {
            Some(_) => Ok(()),
            None => Err(Error::not_found("message", id)),
        }
    }

    /// Inbox or spam placement seen on the receiving side
    pub async fn record_landing(&self, id: WarmupMessageId, in_spam: bool) -> Result<()> {
        self.ensure_exists(id).await?;
        self.messages.mark_landed(id, in_spam, Utc::now()).await?;
        debug!(message_id = %id, in_spam, "Landing recorded");
        Ok(())
    }

    pub async fn record_open(&self, id: WarmupMessageId) -> Result<()> {
        self.ensure_exists(id).await?;
        self.messages.mark_opened(id, Utc::now()).await
    }

    pub async fn record_bounce(&self, id: WarmupMessageId, reason: &str) -> Result<()> {
        self.ensure_exists(id).await?;
        self.messages.mark_bounced(id, reason, Utc::now()).await?;
        warn!(message_id = %id, reason, "Bounce recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_common::types::{ConnectionType, MessageStatus, Provider};
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::{
        Account, ConversationRepository, CreateAccount, CreateConversation, CreateMessage,
        SentUpdate, WarmupMessage,
    };
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_weighted_score() {
        let rates = HealthRates {
            inbox_rate: 90.0,
            spam_rate: 5.0,
            open_rate: 60.0,
            reply_rate: 30.0,
            bounce_rate: 2.0,
        };
        let score = calculate_health_score(&rates);
        assert_eq!(score, 71.65);
        assert_eq!(HealthCategory::from_score(score), HealthCategory::Average);
    }

    #[test]
    fn test_score_bounds() {
        let perfect = HealthRates {
            inbox_rate: 100.0,
            open_rate: 100.0,
            reply_rate: 100.0,
            ..Default::default()
        };
        assert_eq!(calculate_health_score(&perfect), 100.0);

        let worst = HealthRates {
            spam_rate: 100.0,
            bounce_rate: 100.0,
            ..Default::default()
        };
        assert_eq!(calculate_health_score(&worst), 0.0);
        // No data still scores the clean spam and bounce terms
        assert_eq!(calculate_health_score(&HealthRates::default()), 20.0);
    }

    #[test]
    fn test_category_edges() {
        assert_eq!(HealthCategory::from_score(90.0), HealthCategory::Excellent);
        assert_eq!(HealthCategory::from_score(89.99), HealthCategory::Good);
        assert_eq!(HealthCategory::from_score(75.0), HealthCategory::Good);
        assert_eq!(HealthCategory::from_score(60.0), HealthCategory::Average);
        assert_eq!(HealthCategory::from_score(40.0), HealthCategory::Poor);
        assert_eq!(HealthCategory::from_score(39.99), HealthCategory::Critical);
    }

    #[test]
    fn test_rates_round_and_handle_empty() {
        let counts = DeliveryCounts {
            inbound_total: 3,
            inbox_landed: 2,
            spam_landed: 1,
            opened: 1,
            replied: 0,
            outbound_total: 0,
            bounced: 0,
        };
        let rates = compute_rates(&counts);
        assert_eq!(rates.inbox_rate, 66.67);
        assert_eq!(rates.spam_rate, 33.33);
        assert_eq!(rates.open_rate, 33.33);
        assert_eq!(rates.reply_rate, 0.0);
        assert_eq!(rates.bounce_rate, 0.0);
    }

    async fn account(store: &MemoryStore, email: &str) -> Account {
        AccountRepository::create(store, CreateAccount::new(email, Provider::Custom, ConnectionType::Smtp))
            .await
            .unwrap()
    }

    async fn sent_message(store: &MemoryStore, from: &Account, to: &Account, step: i32) -> WarmupMessage {
        let conversation = ConversationRepository::create(
            store,
            CreateConversation {
                sender_id: from.id,
                receiver_id: to.id,
                thread_id: format!("warmup-{}", step),
                subject: "Hi".to_string(),
                template_id: None,
                max_steps: 4,
            },
        )
        .await
        .unwrap();
        let message = MessageRepository::create(
            store,
            CreateMessage {
                conversation_id: conversation.id,
                step,
                sender_id: from.id,
                receiver_id: to.id,
                template_id: None,
                subject: "Hi".to_string(),
                body: "Hello".to_string(),
                correlation_id: Uuid::new_v4(),
                rfc_message_id: format!("{}@example.com", Uuid::new_v4()),
                in_reply_to: None,
            },
        )
        .await
        .unwrap()
        .unwrap();
        store
            .mark_sent(
                message.id,
                SentUpdate {
                    provider_message_id: "p-1".to_string(),
                    provider_thread_id: None,
                    sent_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        message
    }

    #[tokio::test]
    async fn test_recompute_persists_snapshot_and_live_fields() {
        let store = Arc::new(MemoryStore::new());
        let alice = account(&store, "alice@example.com").await;
        let bob = account(&store, "bob@example.org").await;

        let tracker = DeliverabilityTracker::new(store.clone());
        let inbox = sent_message(&store, &alice, &bob, 1).await;
        let spam = sent_message(&store, &alice, &bob, 1).await;
        tracker.record_landing(inbox.id, false).await.unwrap();
        tracker.record_open(inbox.id).await.unwrap();
        tracker.record_landing(spam.id, true).await.unwrap();

        let calculator = HealthCalculator::new(store.clone(), store.clone(), store.clone());
        let snapshot = calculator.recompute(bob.id).await.unwrap();

        assert_eq!(snapshot.inbound_sample, 2);
        assert_eq!(snapshot.inbox_rate, 50.0);
        assert_eq!(snapshot.spam_rate, 50.0);
        assert_eq!(snapshot.open_rate, 50.0);
        // 50*.35 + 50*.25 + 0 + 50*.15 + 100*.05
        assert_eq!(snapshot.health_score, 42.5);

        let bob = AccountRepository::get(store.as_ref(), bob.id).await.unwrap().unwrap();
        assert_eq!(bob.health_score, 42.5);
        assert!(bob.health_updated_at.is_some());
        assert_eq!(calculator.history(bob.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bounce_counts_against_sender() {
        let store = Arc::new(MemoryStore::new());
        let alice = account(&store, "alice@example.com").await;
        let bob = account(&store, "bob@example.org").await;
        let message = sent_message(&store, &alice, &bob, 1).await;

        let tracker = DeliverabilityTracker::new(store.clone());
        tracker.record_bounce(message.id, "550 no such user").await.unwrap();
        let bounced = MessageRepository::get(store.as_ref(), message.id).await.unwrap().unwrap();
        assert_eq!(bounced.status_enum(), Some(MessageStatus::Bounced));

        let calculator = HealthCalculator::new(store.clone(), store.clone(), store.clone());
        let snapshot = calculator.recompute(alice.id).await.unwrap();
        assert_eq!(snapshot.bounce_rate, 100.0);
        assert_eq!(snapshot.outbound_sample, 1);
    }

    #[tokio::test]
    async fn test_tracker_rejects_unknown_message() {
        let store = Arc::new(MemoryStore::new());
        let tracker = DeliverabilityTracker::new(store.clone());
        let err = tracker.record_open(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recompute_all_and_platform_stats() {
        let store = Arc::new(MemoryStore::new());
        let alice = account(&store, "alice@example.com").await;
        let bob = account(&store, "bob@example.org").await;
        let carol = account(&store, "carol@example.net").await;
        store.update_account(carol.id, |a| a.status = AccountStatus::Paused.as_str().to_string());

        let calculator = HealthCalculator::new(store.clone(), store.clone(), store.clone());
        let summary = calculator.recompute_all().await.unwrap();
        assert_eq!(summary, RecomputeSummary { updated: 3, failed: 0 });

        store.update_account(alice.id, |a| a.health_score = 95.0);
        store.update_account(bob.id, |a| a.health_score = 50.0);

        let stats = calculator.platform_stats().await.unwrap();
        assert_eq!(
            stats,
            PlatformStats {
                accounts: 2,
                average_score: 72.5,
                excellent: 1,
                good: 0,
                average: 0,
                poor: 1,
                critical: 0,
            }
        );
    }
}
