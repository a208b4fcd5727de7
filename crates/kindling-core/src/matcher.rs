//! Pool matcher
//!
//! Builds sender -> receiver pairs for a warmup batch. Every eligible account
//! sends at most once per batch. Receivers are drawn independently, so one
//! account can receive from several senders in the same batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use kindling_common::types::AccountId;
use kindling_common::Result;
use kindling_storage::{Account, AccountRepository, MessageRepository};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::quota::is_eligible;

/// One warmup exchange to start
#[derive(Debug, Clone)]
pub struct Pair {
    pub sender: Account,
    pub receiver: Account,
}

/// Pair accounts, avoiding self-pairs and, where possible, recent partners.
/// `recent` maps an account to the accounts it exchanged mail with inside
/// the avoidance window.
pub fn pair_accounts<R: Rng + ?Sized>(
    accounts: &[Account],
    recent: &HashMap<AccountId, HashSet<AccountId>>,
    rng: &mut R,
) -> Vec<Pair> {
    if accounts.len() < 2 {
        return Vec::new();
    }

    let mut used = HashSet::new();
    let mut pairs = Vec::new();

    for sender in accounts {
        if !used.insert(sender.id) {
            continue;
        }

        let others: Vec<&Account> = accounts.iter().filter(|a| a.id != sender.id).collect();
        let fresh: Vec<&Account> = match recent.get(&sender.id) {
            Some(partners) => others
                .iter()
                .copied()
                .filter(|a| !partners.contains(&a.id))
                .collect(),
            None => others.clone(),
        };

        let pool = if fresh.is_empty() { &others } else { &fresh };
        if let Some(receiver) = pool.choose(rng) {
            pairs.push(Pair {
                sender: sender.clone(),
                receiver: (*receiver).clone(),
            });
        }
    }

    pairs
}

pub struct PoolMatcher {
    accounts: Arc<dyn AccountRepository>,
    messages: Arc<dyn MessageRepository>,
    window: Duration,
}

impl PoolMatcher {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        messages: Arc<dyn MessageRepository>,
        window_hours: i64,
    ) -> Self {
        Self {
            accounts,
            messages,
            window: Duration::hours(window_hours),
        }
    }

    /// Active, warmup-enabled accounts still under today's cap
    pub async fn active_eligible_accounts(&self, today: NaiveDate) -> Result<Vec<Account>> {
        let mut accounts = self.accounts.list_warmup_candidates().await?;
        accounts.retain(|a| is_eligible(a, today));
        Ok(accounts)
    }

    /// Pairs for one batch
    pub async fn build_pairs<R: Rng + Send>(
        &self,
        accounts: &[Account],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Vec<Pair>> {
        let since = now - self.window;
        let mut recent = HashMap::new();
        for account in accounts {
            let partners = self.messages.recent_partners(account.id, since).await?;
            recent.insert(account.id, partners.into_iter().collect::<HashSet<_>>());
        }

        let pairs = pair_accounts(accounts, &recent, rng);
        debug!(accounts = accounts.len(), pairs = pairs.len(), "Built warmup pairs");
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_common::types::{ConnectionType, Provider};
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::CreateAccount;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn accounts(store: &MemoryStore, n: usize) -> Vec<Account> {
        let mut out = Vec::new();
        for i in 0..n {
            let input = CreateAccount::new(format!("user{}@example.com", i), Provider::Custom, ConnectionType::Smtp);
            out.push(AccountRepository::create(store, input).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_no_self_pairs_and_unique_senders() {
        let store = MemoryStore::new();
        let pool = accounts(&store, 6).await;

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let pairs = pair_accounts(&pool, &HashMap::new(), &mut rng);

            assert_eq!(pairs.len(), 6);
            let senders: HashSet<_> = pairs.iter().map(|p| p.sender.id).collect();
            assert_eq!(senders.len(), pairs.len());
            assert!(pairs.iter().all(|p| p.sender.id != p.receiver.id));
        }
    }

    #[tokio::test]
    async fn test_single_account_makes_no_pairs() {
        let store = MemoryStore::new();
        let pool = accounts(&store, 1).await;
        let mut rng = StdRng::seed_from_u64(3);
        assert!(pair_accounts(&pool, &HashMap::new(), &mut rng).is_empty());
    }

    #[tokio::test]
    async fn test_recent_partner_avoided_when_possible() {
        let store = MemoryStore::new();
        let pool = accounts(&store, 3).await;
        let (a, b, c) = (pool[0].id, pool[1].id, pool[2].id);

        let mut recent = HashMap::new();
        recent.insert(a, HashSet::from([b]));
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let pairs = pair_accounts(&pool, &recent, &mut rng);
            let from_a = pairs.iter().find(|p| p.sender.id == a).unwrap();
            assert_eq!(from_a.receiver.id, c);
        }

        // Every other account is recent: the filter is dropped for that sender
        recent.insert(a, HashSet::from([b, c]));
        let mut rng = StdRng::seed_from_u64(1);
        let pairs = pair_accounts(&pool, &recent, &mut rng);
        assert!(pairs.iter().any(|p| p.sender.id == a));
    }

    #[tokio::test]
    async fn test_receivers_may_repeat_within_batch() {
        let store = MemoryStore::new();
        let pool = accounts(&store, 3).await;
        let (a, b, c) = (pool[0].id, pool[1].id, pool[2].id);

        // a and b can only reach c without repeating a partner
        let mut recent = HashMap::new();
        recent.insert(a, HashSet::from([b]));
        recent.insert(b, HashSet::from([a]));

        let mut rng = StdRng::seed_from_u64(11);
        let pairs = pair_accounts(&pool, &recent, &mut rng);
        let to_c = pairs.iter().filter(|p| p.receiver.id == c).count();
        assert_eq!(to_c, 2);
    }

    #[tokio::test]
    async fn test_eligible_accounts_filter() {
        let store = Arc::new(MemoryStore::new());
        let pool = accounts(&store, 3).await;
        let today = Utc::now().date_naive();
        store.update_account(pool[0].id, |a| {
            a.emails_per_day = 20;
            a.daily_emails_sent = 20;
            a.last_reset_date = today;
        });
        store.update_account(pool[1].id, |a| a.warmup_enabled = false);

        let matcher = PoolMatcher::new(store.clone(), store.clone(), 24);
        let eligible = matcher.active_eligible_accounts(today).await.unwrap();
        assert_eq!(eligible.iter().map(|a| a.id).collect::<Vec<_>>(), vec![pool[2].id]);
    }
}
