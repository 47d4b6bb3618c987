//! Worker pool that claims jobs and runs their handlers.

use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, HandlerRegistry};
use crate::job::{Job, JobEvent, JobState};
use crate::retry::{RetryManager, RetryPolicy, after};
use crate::store::{ClaimedJob, QueueStore, StoredJob};

const EVENT_CAPACITY: usize = 1024;
const MIN_FETCH_BACKOFF: Duration = Duration::from_millis(100);
const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed at once
    pub concurrency: usize,

    /// Queues to fetch from, highest priority first
    pub queues: Vec<String>,

    /// How long a claim stays valid without renewal
    pub lease: Duration,

    /// Longest a handler may run before the attempt counts as failed
    pub job_timeout: Duration,

    /// Longest a slot blocks waiting for work
    pub fetch_timeout: Duration,

    /// Grace period for running jobs on stop
    pub shutdown_timeout: Duration,

    /// Retry budget and delay curve
    pub retry: RetryPolicy,

    /// Dead set capacity, 0 for unbounded
    pub dead_max_jobs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec!["default".to_string()],
            lease: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(25),
            retry: RetryPolicy::default(),
            dead_max_jobs: 10_000,
        }
    }
}

/// Processes one job at a time; each worker slot owns a clone.
#[derive(Clone)]
pub struct Processor {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryManager,
    queues: Arc<[String]>,
    lease: Duration,
    job_timeout: Duration,
    fetch_timeout: Duration,
    events: broadcast::Sender<JobEvent>,
}

impl Processor {
    /// Claim the next job and run it to an outcome.
    ///
    /// Returns the state the job ended in, or `None` if no job arrived within
    /// the fetch timeout. Errors are store faults only; handler errors and
    /// panics become retries. A job whose claim was lost while it ran is
    /// reported as `Enqueued`: the lease sweep already put it back.
    pub async fn process_next(&self) -> QueueResult<Option<JobState>> {
        let Some(ClaimedJob { job: stored, token }) = self
            .store
            .pop(&self.queues, self.fetch_timeout, self.lease)
            .await?
        else {
            return Ok(None);
        };

        let mut job = match stored.decode() {
            Ok(job) => job,
            Err(e) => {
                return match self
                    .retry
                    .bury_undecodable(&stored, Some(&token), &e.to_string(), Utc::now())
                    .await
                {
                    Ok(()) => {
                        self.emit(undecodable_event(&stored));
                        Ok(Some(JobState::Dead))
                    }
                    Err(QueueError::LeaseExpired(id)) => Ok(lost_claim(&id)),
                    Err(e) => Err(e),
                };
            }
        };

        debug!(job_id = %job.id(), job_type = %job.job_type, queue = %job.queue, "Processing job");
        self.emit(JobEvent::for_job(&job, JobState::InFlight));

        let state = match self.execute(&job, &token).await {
            Ok(()) => {
                if !self.store.ack(&stored.id, &token).await? {
                    warn!(
                        job_id = %job.id(),
                        error = %QueueError::LeaseExpired(stored.id.clone()),
                        "Job finished after losing its claim; it may run again"
                    );
                }
                info!(job_id = %job.id(), job_type = %job.job_type, queue = %job.queue, "Job completed");
                JobState::Completed
            }
            Err(reason) => {
                warn!(job_id = %job.id(), job_type = %job.job_type, error = %reason, "Job failed");
                match self
                    .retry
                    .handle_failure(&mut job, Some(&token), &reason, Utc::now())
                    .await
                {
                    Ok(outcome) => outcome.state(),
                    Err(QueueError::LeaseExpired(id)) => return Ok(lost_claim(&id)),
                    Err(e) => return Err(e),
                }
            }
        };

        self.emit(JobEvent::for_job(&job, state));
        if state == JobState::Retrying {
            self.emit(JobEvent::for_job(&job, JobState::Scheduled));
        }
        Ok(Some(state))
    }

    /// Run the handler in its own task, renewing the lease while it runs.
    async fn execute(&self, job: &Job, token: &str) -> Result<(), String> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(QueueError::NoHandler(job.job_type.clone()).to_string());
        };

        let args = job.args.clone();
        let mut task = tokio::spawn(async move { handler.perform(args).await });

        let deadline = tokio::time::sleep(self.job_timeout);
        tokio::pin!(deadline);

        let period = (self.lease / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let id = job.id().to_string();
        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(e) if e.is_panic() => {
                            Err(format!("handler panicked: {}", panic_message(e.into_panic())))
                        }
                        Err(e) => Err(e.to_string()),
                    };
                }
                _ = &mut deadline => {
                    // The handler task keeps running detached.
                    return Err(format!("job exceeded its timeout of {:?}", self.job_timeout));
                }
                _ = heartbeat.tick() => {
                    match self.store.renew_lease(&id, token, after(Utc::now(), self.lease)).await {
                        Ok(true) => {}
                        Ok(false) => warn!(job_id = %id, "Lease no longer held"),
                        Err(e) => warn!(job_id = %id, error = %e, "Failed to renew lease"),
                    }
                }
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn lost_claim(id: &str) -> Option<JobState> {
    warn!(
        job_id = %id,
        "Claim lost before the outcome was recorded; the job stays with its queue"
    );
    Some(JobState::Enqueued)
}

fn undecodable_event(stored: &StoredJob) -> JobEvent {
    JobEvent {
        job_id: Uuid::parse_str(&stored.id).unwrap_or_default(),
        job_type: None,
        queue: stored.queue.clone(),
        state: JobState::Dead,
        retry_count: 0,
        at: Utc::now(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Pool of worker slots.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    events: broadcast::Sender<JobEvent>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker with the default configuration.
    pub fn new(store: Arc<dyn QueueStore>, registry: HandlerRegistry) -> Self {
        Self::with_config(store, registry, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(
        store: Arc<dyn QueueStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            registry: Arc::new(registry),
            config,
            events,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Register a handler. Fails once the worker has started.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use harbor_queue::*;
    ///
    /// let mut worker = Worker::new(Arc::new(MemoryStore::new()), HandlerRegistry::new());
    /// worker
    ///     .register_handler("send_email", FnHandler::new(|args: JobArgs| async move {
    ///         println!("Sending email: {:?}", args);
    ///         Ok(())
    ///     }))
    ///     .unwrap();
    /// ```
    pub fn register_handler(
        &mut self,
        job_type: impl Into<String>,
        handler: impl Handler,
    ) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        Arc::make_mut(&mut self.registry).register(job_type, handler);
        Ok(())
    }

    /// Receive job state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// The channel this worker publishes transitions on.
    ///
    /// Hand it to a [`Client`](crate::Client) or [`Poller`](crate::Poller) so
    /// their transitions reach the same subscribers.
    pub fn event_sender(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// A single-job processor sharing this worker's store, handlers and events.
    pub fn processor(&self) -> Processor {
        Processor {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            retry: RetryManager::new(
                Arc::clone(&self.store),
                self.config.retry.clone(),
                self.config.dead_max_jobs,
            ),
            queues: self.config.queues.clone().into(),
            lease: self.config.lease,
            job_timeout: self.config.job_timeout,
            fetch_timeout: self.config.fetch_timeout,
            events: self.events.clone(),
        }
    }

    /// Start the worker slots.
    pub fn start(&mut self) -> QueueResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            handlers = ?self.registry.job_types(),
            "Starting worker"
        );

        for slot in 0..self.config.concurrency {
            let processor = self.processor();
            let running = Arc::clone(&self.running);
            self.handles
                .push(tokio::spawn(run_slot(processor, slot, running)));
        }

        Ok(())
    }

    /// Stop fetching and wait for running jobs.
    ///
    /// Slots still busy after the shutdown timeout are aborted; their jobs
    /// stay in flight until the lease sweep puts them back.
    pub async fn stop(&mut self) -> QueueResult<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::WorkerNotRunning);
        }

        info!("Stopping worker");

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut aborted = 0;
        for mut handle in self.handles.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted, "Worker slots aborted after the shutdown timeout");
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Check if the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_slot(processor: Processor, slot: usize, running: Arc<AtomicBool>) {
    let mut backoff = MIN_FETCH_BACKOFF;

    while running.load(Ordering::SeqCst) {
        match processor.process_next().await {
            Ok(_) => backoff = MIN_FETCH_BACKOFF,
            Err(e) => {
                error!(slot, error = %e, retry_in = ?backoff, "Worker slot failed to process a job");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_FETCH_BACKOFF);
            }
        }
    }

    debug!(slot, "Worker slot stopped");
}
