//! Producer side: put jobs into the store.

use chrono::{DateTime, Utc};
use harbor_redis::RedisService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::Config;
use crate::error::QueueResult;
use crate::job::{Job, JobArgs, JobEvent, JobId, JobState};
use crate::retry::after;
use crate::store::{QueueStore, RedisStore, StoredJob};

/// Enqueues jobs. Cheap to clone.
///
/// Each call is a single store write; store errors are returned to the
/// caller and never retried here.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn QueueStore>,
    events: Option<broadcast::Sender<JobEvent>>,
}

impl Client {
    /// Create a client on top of any store.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Report `Enqueued` and `Scheduled` events on `sender`.
    ///
    /// Pass [`Worker::event_sender`](crate::Worker::event_sender) to see a
    /// job's whole life on one channel.
    pub fn with_events(mut self, sender: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Connect to the Redis store named by `config`.
    ///
    /// A producer issues one write at a time, so the pool holds a single
    /// connection.
    pub async fn connect(config: &Config) -> QueueResult<Self> {
        let service = RedisService::new(config.redis_config(1)).await?;
        Ok(Self::new(Arc::new(RedisStore::new(service))))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Enqueue a job for immediate execution.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use harbor_queue::{Client, MemoryStore};
    /// # use serde_json::json;
    /// # #[tokio::main]
    /// # async fn main() -> harbor_queue::QueueResult<()> {
    /// let client = Client::new(Arc::new(MemoryStore::new()));
    /// let id = client.enqueue("default", "HardWorker", vec![json!("super hard"), json!(2)]).await?;
    /// # assert!(!id.is_nil());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        args: JobArgs,
    ) -> QueueResult<JobId> {
        self.enqueue_job(Job::new(queue, job_type, args)).await
    }

    /// Enqueue a job to run no earlier than `at`.
    ///
    /// The job always goes through the scheduled set, even when `at` is in
    /// the past; the poller promotes it on its next pass.
    pub async fn enqueue_at(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        args: JobArgs,
        at: DateTime<Utc>,
    ) -> QueueResult<JobId> {
        let job = Job::new(queue, job_type, args).schedule_at(at);
        self.schedule(&job, at).await?;
        Ok(job.id())
    }

    /// Enqueue a job to run after `delay`.
    pub async fn enqueue_in(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        args: JobArgs,
        delay: Duration,
    ) -> QueueResult<JobId> {
        self.enqueue_at(queue, job_type, args, after(Utc::now(), delay))
            .await
    }

    /// Enqueue a prebuilt job. A future `run_at` sends it to the scheduled set.
    pub async fn enqueue_job(&self, mut job: Job) -> QueueResult<JobId> {
        let now = Utc::now();
        match job.run_at {
            Some(at) if at > now => self.schedule(&job, at).await?,
            _ => {
                job.enqueued_at = Some(now);
                self.store.push(&StoredJob::encode(&job)?).await?;
                debug!(job_id = %job.id(), job_type = %job.job_type, queue = %job.queue, "Job enqueued");
                self.emit(&job, JobState::Enqueued);
            }
        }
        Ok(job.id())
    }

    async fn schedule(&self, job: &Job, at: DateTime<Utc>) -> QueueResult<()> {
        // Unclaimed writes always land.
        self.store
            .schedule_at(&StoredJob::encode(job)?, None, at)
            .await?;
        debug!(job_id = %job.id(), job_type = %job.job_type, queue = %job.queue, run_at = %at, "Job scheduled");
        self.emit(job, JobState::Scheduled);
        Ok(())
    }

    fn emit(&self, job: &Job, state: JobState) {
        if let Some(events) = &self.events {
            let _ = events.send(JobEvent::for_job(job, state));
        }
    }
}
