//! Recurring job definitions and the ticker that fires them
//!
//! Each definition fires through a compare-and-set on `next_run_at`, so with
//! several server processes exactly one of them enqueues an occurrence.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use kindling_common::Result;
use kindling_storage::{NewRecurringJob, RecurringJob};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobKind, JobQueue, Schedule};

/// The engine's recurring jobs and their schedules
pub fn default_definitions() -> Vec<(JobKind, Schedule)> {
    vec![
        (JobKind::ScheduleWarmupBatch {}, Schedule::Hourly),
        (JobKind::PollAllInboxes {}, Schedule::EveryMinutes(15)),
        (
            JobKind::ResetDailyCounters {},
            Schedule::daily_at(0, 0).unwrap_or(Schedule::Hourly),
        ),
        (
            JobKind::AdjustGradualVolume {},
            Schedule::daily_at(1, 0).unwrap_or(Schedule::Hourly),
        ),
        (JobKind::UpdateAllHealthScores {}, Schedule::EveryHours(6)),
    ]
}

pub struct RecurringScheduler {
    queue: JobQueue,
    tick: StdDuration,
}

impl RecurringScheduler {
    pub fn new(queue: JobQueue, tick: StdDuration) -> Self {
        Self { queue, tick }
    }

    /// Insert the default definitions; existing ones are left untouched
    pub async fn register_defaults(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut registered = 0;
        for (job, schedule) in default_definitions() {
            let inserted = self
                .queue
                .repository()
                .register_recurring(NewRecurringJob {
                    name: job.name().to_string(),
                    queue: self.queue.name().to_string(),
                    payload: job.payload()?,
                    schedule: schedule.to_string(),
                    next_run_at: schedule.next_after(now),
                })
                .await?;
            if inserted {
                debug!(job = job.name(), schedule = %schedule, "Registered recurring job");
                registered += 1;
            }
        }
        info!(registered, "Recurring jobs registered");
        Ok(registered)
    }

    /// Fire every definition due at `now`. Returns the number enqueued here.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.queue.repository().due_recurring(now).await?;
        let mut fired = 0;

        for definition in due {
            match self.fire(&definition, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job = %definition.name, error = %e, "Failed to fire recurring job")
                }
            }
        }
        Ok(fired)
    }

    async fn fire(&self, definition: &RecurringJob, now: DateTime<Utc>) -> Result<bool> {
        let schedule: Schedule = definition.schedule.parse()?;
        let job = JobKind::from_parts(&definition.name, &definition.payload)?;

        // Missed occurrences collapse into one
        let next = schedule.next_after(now);
        let won = self
            .queue
            .repository()
            .advance_recurring(&definition.name, definition.next_run_at, next, now)
            .await?;
        if !won {
            debug!(job = %definition.name, "Occurrence fired elsewhere");
            return Ok(false);
        }

        self.queue.enqueue(&job).await?;
        debug!(job = %definition.name, next_run_at = %next, "Recurring job fired");
        Ok(true)
    }

    /// Tick until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_secs = self.tick.as_secs(), "Recurring scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(Utc::now()).await {
                Ok(0) => {}
                Ok(fired) => debug!(fired, "Recurring jobs enqueued"),
                Err(e) => warn!(error = %e, "Recurring tick failed"),
            }
        }

        info!("Recurring scheduler stopped");
    }
}
