//! Job queue
//!
//! Jobs are rows in the `jobs` table with a name, a JSON payload and a
//! release timestamp. Workers claim due rows, run the matching handler and
//! settle the row. Recurring definitions live in `recurring_jobs` and are
//! turned into ordinary jobs by the ticker.

pub mod handlers;
pub mod recurring;
pub mod schedule;
pub mod worker;

use std::sync::Arc;

use chrono::{Duration, Utc};
use kindling_common::types::{AccountId, ConversationId, WarmupMessageId};
use kindling_common::{Error, Result};
use kindling_storage::{Job, JobRepository, JobStats, NewJob};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use handlers::JobHandlers;
pub use recurring::RecurringScheduler;
pub use schedule::Schedule;
pub use worker::{JobRunner, QueueWorker, Settlement};

/// Queue every warmup job runs on
pub const WARMUP_QUEUE: &str = "warmup";

/// Every job the engine knows how to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum JobKind {
    ScheduleWarmupBatch {},
    PollAllInboxes {},
    #[serde(rename_all = "camelCase")]
    CheckInbox { account_id: AccountId },
    #[serde(rename_all = "camelCase")]
    SendInitialMessage { message_id: WarmupMessageId },
    #[serde(rename_all = "camelCase")]
    SendReply { original_message_id: WarmupMessageId },
    #[serde(rename_all = "camelCase")]
    ArchiveMessage { message_id: WarmupMessageId },
    #[serde(rename_all = "camelCase")]
    ArchiveConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    UpdateAccountHealth { account_id: AccountId },
    UpdateAllHealthScores {},
    ResetDailyCounters {},
    AdjustGradualVolume {},
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::ScheduleWarmupBatch {} => "schedule-warmup-batch",
            JobKind::PollAllInboxes {} => "poll-all-inboxes",
            JobKind::CheckInbox { .. } => "check-inbox",
            JobKind::SendInitialMessage { .. } => "send-initial-message",
            JobKind::SendReply { .. } => "send-reply",
            JobKind::ArchiveMessage { .. } => "archive-message",
            JobKind::ArchiveConversation { .. } => "archive-conversation",
            JobKind::UpdateAccountHealth { .. } => "update-account-health",
            JobKind::UpdateAllHealthScores {} => "update-all-health-scores",
            JobKind::ResetDailyCounters {} => "reset-daily-counters",
            JobKind::AdjustGradualVolume {} => "adjust-gradual-volume",
        }
    }

    /// Payload object stored next to the name
    pub fn payload(&self) -> Result<serde_json::Value> {
        let mut tagged = serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("Failed to encode job: {}", e)))?;
        Ok(tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({})))
    }

    /// Rebuild a job from its stored row
    pub fn from_parts(name: &str, payload: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(serde_json::json!({ "name": name, "payload": payload }))
            .map_err(|e| Error::Validation(format!("Unrecognized job {}: {}", name, e)))
    }

    pub fn from_job(job: &Job) -> Result<Self> {
        Self::from_parts(&job.name, &job.payload)
    }
}

/// Handle for enqueuing jobs
#[derive(Clone)]
pub struct JobQueue {
    jobs: Arc<dyn JobRepository>,
    queue: String,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobRepository>, queue: impl Into<String>, max_attempts: i32) -> Self {
        Self {
            jobs,
            queue: queue.into(),
            max_attempts,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    /// Enqueue a job due now
    pub async fn enqueue(&self, job: &JobKind) -> Result<Option<Job>> {
        self.push(job, Duration::zero(), None).await
    }

    /// Enqueue a job released after `delay`
    pub async fn enqueue_in(&self, job: &JobKind, delay: Duration) -> Result<Option<Job>> {
        self.push(job, delay, None).await
    }

    /// Enqueue unless a job with the same dedupe key was ever enqueued.
    /// Returns `None` for the duplicate.
    pub async fn enqueue_unique(
        &self,
        job: &JobKind,
        dedupe_key: impl Into<String>,
        delay: Duration,
    ) -> Result<Option<Job>> {
        self.push(job, delay, Some(dedupe_key.into())).await
    }

    async fn push(
        &self,
        job: &JobKind,
        delay: Duration,
        dedupe_key: Option<String>,
    ) -> Result<Option<Job>> {
        let input = NewJob {
            queue: self.queue.clone(),
            name: job.name().to_string(),
            payload: job.payload()?,
            max_attempts: self.max_attempts,
            dedupe_key,
            scheduled_at: Utc::now() + delay,
        };
        let key = input.dedupe_key.clone();

        let enqueued = self.jobs.enqueue(input).await?;
        match &enqueued {
            Some(row) => debug!(job_id = %row.id, job = job.name(), "Enqueued job"),
            None => debug!(job = job.name(), dedupe_key = ?key, "Duplicate job skipped"),
        }
        Ok(enqueued)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.jobs.stats(&self.queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_storage::memory::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_names_match_serde_tags() {
        let id = Uuid::new_v4();
        let all = [
            JobKind::ScheduleWarmupBatch {},
            JobKind::PollAllInboxes {},
            JobKind::CheckInbox { account_id: id },
            JobKind::SendInitialMessage { message_id: id },
            JobKind::SendReply { original_message_id: id },
            JobKind::ArchiveMessage { message_id: id },
            JobKind::ArchiveConversation { conversation_id: id },
            JobKind::UpdateAccountHealth { account_id: id },
            JobKind::UpdateAllHealthScores {},
            JobKind::ResetDailyCounters {},
            JobKind::AdjustGradualVolume {},
        ];

        for job in all {
            let tagged = serde_json::to_value(&job).unwrap();
            assert_eq!(tagged["name"], json!(job.name()));
            let back = JobKind::from_parts(job.name(), &job.payload().unwrap()).unwrap();
            assert_eq!(back, job);
        }
    }

    #[test]
    fn test_payload_field_names() {
        let id = Uuid::nil();
        assert_eq!(
            JobKind::SendReply { original_message_id: id }.payload().unwrap(),
            json!({ "originalMessageId": id })
        );
        assert_eq!(JobKind::PollAllInboxes {}.payload().unwrap(), json!({}));
    }

    #[test]
    fn test_unknown_job_is_validation_error() {
        let err = JobKind::from_parts("send-fax", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_enqueue_unique_skips_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        let job = JobKind::ArchiveConversation { conversation_id: Uuid::new_v4() };

        assert!(queue.enqueue_unique(&job, "archive-conversation:1", Duration::zero()).await.unwrap().is_some());
        assert!(queue.enqueue_unique(&job, "archive-conversation:1", Duration::zero()).await.unwrap().is_none());
        queue.enqueue(&job).await.unwrap();

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].max_attempts, 3);
        assert_eq!(jobs[0].name, "archive-conversation");
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_enqueue_in_delays_release() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        queue
            .enqueue_in(&JobKind::ResetDailyCounters {}, Duration::hours(2))
            .await
            .unwrap();

        let claimed = store.claim_due(WARMUP_QUEUE, Utc::now(), 10).await.unwrap();
        assert!(claimed.is_empty());
        let later = store
            .claim_due(WARMUP_QUEUE, Utc::now() + Duration::hours(3), 10)
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }
}
