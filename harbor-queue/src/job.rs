//! Job envelope and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Ordered handler arguments.
pub type JobArgs = Vec<serde_json::Value>;

/// Lifecycle state of a job.
///
/// `Enqueued -> InFlight -> {Completed | Retrying | Dead}` and
/// `Retrying -> Scheduled -> Enqueued`. `Completed` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in a ready queue
    Enqueued,
    /// Waiting in the scheduled set for its run time
    Scheduled,
    /// Claimed by a worker slot
    InFlight,
    /// Failed and rescheduled
    Retrying,
    /// Finished successfully
    Completed,
    /// Retry budget exhausted or undecodable
    Dead,
}

impl JobState {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Enqueued => "enqueued",
            Self::Scheduled => "scheduled",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// A unit of work: which handler to run, with what arguments.
///
/// The id never changes after creation and the retry count only grows, so
/// both are private and exposed through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "jid")]
    id: JobId,

    /// Handler name used to resolve the handler in the registry
    #[serde(rename = "class")]
    pub job_type: String,

    /// Handler arguments
    pub args: JobArgs,

    /// Queue name
    pub queue: String,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the producer pushed the job straight onto a ready queue
    ///
    /// Unset for jobs that started in the scheduled set. Promotion, retries
    /// and lease recovery leave it as it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Number of retries already scheduled
    #[serde(default)]
    retry_count: u32,

    /// Do not run before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,

    /// Reason for the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// When the most recent failure happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    /// Create a new job.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, args: JobArgs) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            args,
            queue: queue.into(),
            created_at: Utc::now(),
            enqueued_at: None,
            retry_count: 0,
            run_at: None,
            error_message: None,
            failed_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Unique job id.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Number of retries already scheduled.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Schedule the job for later.
    pub fn schedule_at(mut self, time: DateTime<Utc>) -> Self {
        self.run_at = Some(time);
        self
    }

    /// Schedule the job after a delay.
    pub fn schedule_after(mut self, delay: chrono::Duration) -> Self {
        self.run_at = Some(Utc::now() + delay);
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at.is_none_or(|at| at <= now)
    }

    /// Record a failure without touching the retry count.
    pub(crate) fn record_failure(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.error_message = Some(reason.into());
        self.failed_at = Some(at);
    }

    /// Bump the retry count and set the next run time.
    pub(crate) fn schedule_retry(&mut self, run_at: DateTime<Utc>) {
        self.retry_count += 1;
        self.run_at = Some(run_at);
    }
}

/// A state transition observed by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    /// Job id
    pub job_id: JobId,
    /// Handler name, when the envelope could be decoded
    pub job_type: Option<String>,
    /// Queue the job came from
    pub queue: String,
    /// State entered
    pub state: JobState,
    /// Retry count at the time of the transition
    pub retry_count: u32,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub(crate) fn for_job(job: &Job, state: JobState) -> Self {
        Self {
            job_id: job.id,
            job_type: Some(job.job_type.clone()),
            queue: job.queue.clone(),
            state,
            retry_count: job.retry_count,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = Job::new("default", "echo", vec![json!("hi")]);

        assert_eq!(job.queue, "default");
        assert_eq!(job.job_type, "echo");
        assert_eq!(job.args, vec![json!("hi")]);
        assert_eq!(job.retry_count(), 0);
        assert!(job.run_at.is_none());
    }

    #[test]
    fn test_job_id_uniqueness() {
        let job1 = Job::new("default", "task", vec![]);
        let job2 = Job::new("default", "task", vec![]);

        assert_ne!(job1.id(), job2.id());
    }

    #[test]
    fn test_job_timestamps() {
        let before = Utc::now();
        let job = Job::new("default", "task", vec![]);
        let after = Utc::now();

        assert!(job.created_at >= before);
        assert!(job.created_at <= after);
    }

    #[test]
    fn test_job_due() {
        let now = Utc::now();
        let job = Job::new("default", "task", vec![]);
        assert!(job.is_due(now));

        let later = job.clone().schedule_at(now + chrono::Duration::hours(1));
        assert!(!later.is_due(now));
        assert!(later.is_due(now + chrono::Duration::hours(1)));

        let past = job.schedule_at(now - chrono::Duration::hours(1));
        assert!(past.is_due(now));
    }

    #[test]
    fn test_retry_count_only_increases() {
        let now = Utc::now();
        let mut job = Job::new("default", "task", vec![]);

        job.record_failure("boom", now);
        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        job.schedule_retry(now + chrono::Duration::seconds(15));
        job.schedule_retry(now + chrono::Duration::seconds(30));
        assert_eq!(job.retry_count(), 2);
        assert_eq!(job.run_at, Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_job_metadata_overwrite() {
        let job = Job::new("default", "task", vec![])
            .with_metadata("key", "value1")
            .with_metadata("key", "value2");

        assert_eq!(job.metadata.get("key"), Some(&"value2".to_string()));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
        assert!(!JobState::InFlight.is_terminal());
        assert_eq!(JobState::InFlight.to_string(), "in_flight");
    }

    #[test]
    fn test_event_for_job() {
        let job = Job::new("mailers", "deliver", vec![]);
        let event = JobEvent::for_job(&job, JobState::InFlight);

        assert_eq!(event.job_id, job.id());
        assert_eq!(event.job_type.as_deref(), Some("deliver"));
        assert_eq!(event.queue, "mailers");
        assert_eq!(event.state, JobState::InFlight);
    }
}
