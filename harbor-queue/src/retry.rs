//! Retry scheduling and the dead-letter path.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::store::{QueueStore, StoredJob};

/// Delay curve between attempts.
///
/// Every variant is a pure function of the retry count and the job id, so a
/// given job always gets the same schedule and the delay never shrinks as
/// the count grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^n`, capped at `max`, plus per-job jitter.
    Exponential {
        /// Delay before the first retry
        base: Duration,
        /// Upper bound before jitter
        max: Duration,
    },
    /// `n^4 + 15` seconds plus per-job jitter.
    Polynomial,
    /// Same delay every time.
    Fixed(Duration),
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(15),
            max: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry_count + 1` of job `id`.
    pub fn delay(&self, retry_count: u32, id: JobId) -> Duration {
        match self {
            Self::Exponential { base, max } => {
                let curve = base
                    .saturating_mul(2u32.saturating_pow(retry_count))
                    .min(*max);
                curve.saturating_add(jitter(retry_count, id))
            }
            Self::Polynomial => {
                let secs = u64::from(retry_count).saturating_pow(4).saturating_add(15);
                Duration::from_secs(secs).saturating_add(jitter(retry_count, id))
            }
            Self::Fixed(delay) => *delay,
        }
    }
}

/// Between 0 and 9 seconds per attempt, fixed by the job id.
fn jitter(retry_count: u32, id: JobId) -> Duration {
    let spread = (id.as_u128() % 10) as u64;
    Duration::from_secs(spread.saturating_mul(u64::from(retry_count) + 1))
}

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed before a job is declared dead
    pub max_retries: u32,
    /// Delay curve
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 25,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Default curve with a custom retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Set the delay curve.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if a job that already retried `retry_count` times may retry again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// When the next attempt of `job` should run after a failure at `now`.
    pub fn next_run_at(&self, job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.backoff.delay(job.retry_count(), job.id()))
    }
}

/// `now + delay`, saturating at the largest representable time.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled to run again at the given time
    Retrying(DateTime<Utc>),
    /// Moved to the dead set
    Dead,
}

impl FailureOutcome {
    /// The job state this outcome corresponds to.
    pub fn state(&self) -> JobState {
        match self {
            Self::Retrying(_) => JobState::Retrying,
            Self::Dead => JobState::Dead,
        }
    }
}

/// Routes failed jobs to the scheduled set or the dead set.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    dead_max_jobs: usize,
}

impl RetryManager {
    /// Create a manager.
    pub fn new(store: Arc<dyn QueueStore>, policy: RetryPolicy, dead_max_jobs: usize) -> Self {
        Self {
            store,
            policy,
            dead_max_jobs,
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure and either reschedule the job or bury it.
    ///
    /// `claim` is the token from the `pop` that delivered the job, or `None`
    /// for a job that was never claimed. If the claim has been lost, nothing
    /// is written and [`QueueError::LeaseExpired`] is returned: the job is
    /// back in its queue or held by another slot, which will record its own
    /// outcome.
    pub async fn handle_failure(
        &self,
        job: &mut Job,
        claim: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FailureOutcome> {
        job.record_failure(reason, now);

        if self.policy.should_retry(job.retry_count()) {
            let run_at = self.policy.next_run_at(job, now);
            job.schedule_retry(run_at);
            if !self
                .store
                .schedule_at(&StoredJob::encode(job)?, claim, run_at)
                .await?
            {
                return Err(QueueError::LeaseExpired(job.id().to_string()));
            }

            info!(
                job_id = %job.id(),
                job_type = %job.job_type,
                queue = %job.queue,
                retry_count = job.retry_count(),
                %run_at,
                error = reason,
                "Job failed, retry scheduled"
            );
            Ok(FailureOutcome::Retrying(run_at))
        } else {
            if !self
                .store
                .bury(&StoredJob::encode(job)?, claim, reason, now, self.dead_max_jobs)
                .await?
            {
                return Err(QueueError::LeaseExpired(job.id().to_string()));
            }

            warn!(
                job_id = %job.id(),
                job_type = %job.job_type,
                queue = %job.queue,
                retry_count = job.retry_count(),
                error = reason,
                "Job exhausted its retries, moved to the dead set"
            );
            Ok(FailureOutcome::Dead)
        }
    }

    /// Bury a payload that could not be decoded. It is never retried.
    pub async fn bury_undecodable(
        &self,
        stored: &StoredJob,
        claim: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        if !self
            .store
            .bury(stored, claim, reason, now, self.dead_max_jobs)
            .await?
        {
            return Err(QueueError::LeaseExpired(stored.id.clone()));
        }

        warn!(
            job_id = %stored.id,
            queue = %stored.queue,
            error = reason,
            "Undecodable job moved to the dead set"
        );
        Ok(())
    }
}
