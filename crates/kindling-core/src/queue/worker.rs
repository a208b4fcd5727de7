//! Queue worker
//!
//! Claims due jobs, runs them under a semaphore and settles every claimed
//! row exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kindling_common::config::QueueConfig;
use kindling_common::{Error, Result};
use kindling_storage::{Job, JobRepository};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::JobKind;

/// Runs a decoded job
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobKind) -> Result<()>;
}

/// How a claimed job leaves the `processing` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Retry { attempts: i32, run_at: DateTime<Utc> },
    Deferred { run_at: DateTime<Utc> },
    Failed { attempts: i32 },
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped
pub fn backoff(config: &QueueConfig, attempt: i32) -> Duration {
    let exponent = u32::try_from(attempt.max(1) - 1).unwrap_or(0);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = config
        .backoff_base_secs
        .saturating_mul(factor)
        .min(config.backoff_max_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Decide the settlement of one run
pub fn settle(job: &Job, outcome: &Result<()>, config: &QueueConfig, now: DateTime<Utc>) -> Settlement {
    let err = match outcome {
        Ok(()) => return Settlement::Completed,
        Err(e) => e,
    };

    if let Error::QuotaDeferred(_) = err {
        if job.deferrals >= config.max_deferrals {
            return Settlement::Failed {
                attempts: job.attempts,
            };
        }
        let secs = i64::try_from(config.quota_defer_secs).unwrap_or(i64::MAX / 1000);
        return Settlement::Deferred {
            run_at: now + Duration::seconds(secs),
        };
    }

    let attempts = job.attempts + 1;
    if err.is_retryable() && attempts < job.max_attempts {
        Settlement::Retry {
            attempts,
            run_at: now + backoff(config, attempts),
        }
    } else {
        Settlement::Failed { attempts }
    }
}

/// One worker loop over a queue
#[derive(Clone)]
pub struct QueueWorker {
    jobs: Arc<dyn JobRepository>,
    runner: Arc<dyn JobRunner>,
    queue: String,
    config: QueueConfig,
    permits: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        runner: Arc<dyn JobRunner>,
        queue: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            jobs,
            runner,
            queue: queue.into(),
            config,
            permits,
        }
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(queue = %self.queue, concurrency = self.config.concurrency, "Queue worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.release_stale().await {
                error!(queue = %self.queue, error = %e, "Failed to release stale jobs");
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %self.queue, jobs = n, "Processed batch"),
                Err(e) => error!(queue = %self.queue, error = %e, "Error processing queue"),
            }
        }

        info!(queue = %self.queue, "Queue worker stopped");
    }

    /// Claim one batch and wait for every job in it to settle
    pub async fn poll_once(&self) -> Result<usize> {
        let claimed = self
            .jobs
            .claim_due(&self.queue, Utc::now(), self.config.batch_size)
            .await?;
        let count = claimed.len();

        let mut running = JoinSet::new();
        for job in claimed {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Worker semaphore closed: {}", e)))?;
            let worker = self.clone();
            running.spawn(async move {
                worker.process(job).await;
                drop(permit);
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.queue, error = %e, "Job task panicked");
            }
        }
        Ok(count)
    }

    /// Put jobs left in `processing` by a crashed worker back in line
    pub async fn release_stale(&self) -> Result<u64> {
        let secs = i64::try_from(self.config.stale_after_secs).unwrap_or(i64::MAX / 1000);
        let released = self
            .jobs
            .release_stale(Utc::now() - Duration::seconds(secs))
            .await?;
        if released > 0 {
            warn!(queue = %self.queue, released, "Released stale jobs");
        }
        Ok(released)
    }

    async fn process(&self, job: Job) {
        debug!(job_id = %job.id, job = %job.name, attempt = job.attempts + 1, "Job claimed");

        let outcome = match JobKind::from_job(&job) {
            Ok(kind) => self.runner.run(&kind).await,
            Err(e) => Err(e),
        };

        let settlement = settle(&job, &outcome, &self.config, Utc::now());
        let message = outcome.err().map(|e| e.to_string()).unwrap_or_default();

        let stored = match &settlement {
            Settlement::Completed => {
                debug!(job_id = %job.id, job = %job.name, "Job completed");
                self.jobs.complete(job.id, Utc::now()).await
            }
            Settlement::Retry { attempts, run_at } => {
                warn!(
                    job_id = %job.id,
                    job = %job.name,
                    attempts,
                    retry_at = %run_at,
                    error = %message,
                    "Job failed, retrying"
                );
                self.jobs.retry(job.id, *attempts, &message, *run_at).await
            }
            Settlement::Deferred { run_at } => {
                info!(
                    job_id = %job.id,
                    job = %job.name,
                    deferrals = job.deferrals + 1,
                    run_at = %run_at,
                    "Job deferred"
                );
                self.jobs.defer(job.id, &message, *run_at).await
            }
            Settlement::Failed { attempts } => {
                error!(job_id = %job.id, job = %job.name, attempts, error = %message, "Job failed");
                self.jobs.fail(job.id, *attempts, &message, Utc::now()).await
            }
        };

        if let Err(e) = stored {
            error!(job_id = %job.id, error = %e, "Failed to settle job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobQueue, WARMUP_QUEUE};
    use kindling_common::types::JobStatus;
    use kindling_storage::memory::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn config() -> QueueConfig {
        QueueConfig {
            backoff_base_secs: 5,
            backoff_max_secs: 60,
            max_attempts: 3,
            max_deferrals: 2,
            quota_defer_secs: 3600,
            ..Default::default()
        }
    }

    fn job(attempts: i32, deferrals: i32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            queue: WARMUP_QUEUE.to_string(),
            name: "reset-daily-counters".to_string(),
            payload: serde_json::json!({}),
            status: JobStatus::Processing.as_str().to_string(),
            attempts,
            max_attempts: 3,
            deferrals,
            dedupe_key: None,
            last_error: None,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
        }
    }

    /// Replays a scripted outcome per call
    struct Scripted {
        outcomes: Mutex<Vec<Result<()>>>,
        seen: Mutex<Vec<JobKind>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<()>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobRunner for Scripted {
        async fn run(&self, job: &JobKind) -> Result<()> {
            self.seen.lock().unwrap().push(job.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff(&config, 1), Duration::seconds(5));
        assert_eq!(backoff(&config, 2), Duration::seconds(10));
        assert_eq!(backoff(&config, 3), Duration::seconds(20));
        assert_eq!(backoff(&config, 5), Duration::seconds(60));
        assert_eq!(backoff(&config, 200), Duration::seconds(60));
    }

    #[test]
    fn test_settlement_rules() {
        let config = config();
        let now = Utc::now();

        assert_eq!(settle(&job(0, 0), &Ok(()), &config, now), Settlement::Completed);

        assert_eq!(
            settle(&job(0, 0), &Err(Error::Transient("503".into())), &config, now),
            Settlement::Retry { attempts: 1, run_at: now + Duration::seconds(5) }
        );
        assert_eq!(
            settle(&job(2, 0), &Err(Error::Transient("503".into())), &config, now),
            Settlement::Failed { attempts: 3 }
        );
        assert_eq!(
            settle(&job(0, 0), &Err(Error::Auth("revoked".into())), &config, now),
            Settlement::Failed { attempts: 1 }
        );

        let quota = Err(Error::QuotaDeferred(Uuid::new_v4()));
        assert_eq!(
            settle(&job(1, 1), &quota, &config, now),
            Settlement::Deferred { run_at: now + Duration::hours(1) }
        );
        assert_eq!(settle(&job(1, 2), &quota, &config, now), Settlement::Failed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        let queued = queue.enqueue(&JobKind::ResetDailyCounters {}).await.unwrap().unwrap();

        let runner = Arc::new(Scripted::new(vec![Err(Error::Transient("timeout".into()))]));
        let worker = QueueWorker::new(store.clone(), runner.clone(), WARMUP_QUEUE, config());

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let row = JobRepository::get(store.as_ref(), queued.id).await.unwrap().unwrap();
        assert_eq!(row.status_enum(), Some(JobStatus::Pending));
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("Transient provider error: timeout"));

        // Not released yet
        assert_eq!(worker.poll_once().await.unwrap(), 0);

        store.release_all_jobs();
        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let row = JobRepository::get(store.as_ref(), queued.id).await.unwrap().unwrap();
        assert_eq!(row.status_enum(), Some(JobStatus::Completed));
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_quota_deferral_keeps_attempts() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        let queued = queue.enqueue(&JobKind::AdjustGradualVolume {}).await.unwrap().unwrap();

        let runner = Arc::new(Scripted::new(vec![
            Err(Error::QuotaDeferred(Uuid::new_v4())),
            Err(Error::QuotaDeferred(Uuid::new_v4())),
            Err(Error::QuotaDeferred(Uuid::new_v4())),
        ]));
        let worker = QueueWorker::new(store.clone(), runner, WARMUP_QUEUE, config());

        worker.poll_once().await.unwrap();
        let row = JobRepository::get(store.as_ref(), queued.id).await.unwrap().unwrap();
        assert_eq!(row.status_enum(), Some(JobStatus::Pending));
        assert_eq!((row.attempts, row.deferrals), (0, 1));
        assert!(row.scheduled_at > Utc::now() + Duration::minutes(59));

        store.release_all_jobs();
        worker.poll_once().await.unwrap();
        store.release_all_jobs();
        worker.poll_once().await.unwrap();

        let row = JobRepository::get(store.as_ref(), queued.id).await.unwrap().unwrap();
        assert_eq!(row.status_enum(), Some(JobStatus::Failed));
        assert_eq!((row.attempts, row.deferrals), (0, 2));
    }

    #[tokio::test]
    async fn test_unknown_job_fails_without_retry() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(kindling_storage::NewJob {
                queue: WARMUP_QUEUE.to_string(),
                name: "send-fax".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
                dedupe_key: None,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();

        let runner = Arc::new(Scripted::new(vec![]));
        let worker = QueueWorker::new(store.clone(), runner.clone(), WARMUP_QUEUE, config());
        worker.poll_once().await.unwrap();

        let stats = store.stats(WARMUP_QUEUE).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_jobs_are_released() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        queue.enqueue(&JobKind::PollAllInboxes {}).await.unwrap();
        let claimed = store.claim_due(WARMUP_QUEUE, Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let worker = QueueWorker::new(
            store.clone(),
            Arc::new(Scripted::new(vec![])),
            WARMUP_QUEUE,
            QueueConfig {
                stale_after_secs: 0,
                ..config()
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(worker.release_stale().await.unwrap(), 1);
        assert_eq!(store.stats(WARMUP_QUEUE).await.unwrap().pending, 1);
    }
}
