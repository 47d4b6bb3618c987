//! Promotes scheduled jobs into their ready queue once they are due.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{JobEvent, JobState};
use crate::store::QueueStore;

/// Scale `interval` by a random factor in `[0.5, 1.5)`.
///
/// Several processes polling the same store then drift apart instead of
/// hitting it in lockstep.
pub(crate) fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::rng().random_range(0.5..1.5))
}

/// Periodically moves due entries of the scheduled set to their queues.
///
/// Safe to run in any number of processes at once: the move is atomic in
/// the store.
pub struct Poller {
    store: Arc<dyn QueueStore>,
    interval: Duration,
    events: Option<broadcast::Sender<JobEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Create a poller.
    pub fn new(store: Arc<dyn QueueStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            events: None,
            handle: None,
        }
    }

    /// Report an `Enqueued` event for each promoted job on `sender`.
    pub fn with_events(mut self, sender: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Average time between polls.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Promote everything due at `now`. Returns the number of jobs moved.
    pub async fn run_once(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        promote(self.store.as_ref(), self.events.as_ref(), now).await
    }

    /// Start polling in the background.
    pub fn start(&mut self) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::Other("poller already running".to_string()));
        }

        info!(interval = ?self.interval, "Starting scheduled job poller");

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                match promote(store.as_ref(), events.as_ref(), Utc::now()).await {
                    Ok(0) => {}
                    Ok(moved) => debug!(moved, "Promoted scheduled jobs"),
                    Err(e) => warn!(error = %e, "Failed to promote scheduled jobs"),
                }
            }
        }));

        Ok(())
    }

    /// Stop polling.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // Cancelled is the expected outcome
            let _ = handle.await;
            info!("Scheduled job poller stopped");
        }
    }

    /// Check if the poller is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn promote(
    store: &dyn QueueStore,
    events: Option<&broadcast::Sender<JobEvent>>,
    now: DateTime<Utc>,
) -> QueueResult<usize> {
    let moved = store.move_due(now).await?;
    if let Some(events) = events {
        // Undecodable entries are reported when a worker buries them.
        for job in moved.iter().filter_map(|stored| stored.decode().ok()) {
            let _ = events.send(JobEvent::for_job(&job, JobState::Enqueued));
        }
    }
    Ok(moved.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::{MemoryStore, StoredJob};

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_millis(1000);
        for _ in 0..1000 {
            let delay = jittered(interval);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn test_run_once_moves_only_due_jobs() {
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(store.clone(), Duration::from_secs(5));
        let now = Utc::now();

        let job = Job::new("default", "echo", vec![]);
        store
            .schedule_at(
                &StoredJob::encode(&job).unwrap(),
                None,
                now + chrono::Duration::seconds(10),
            )
            .await
            .unwrap();

        assert_eq!(poller.run_once(now).await.unwrap(), 0);
        assert_eq!(poller.run_once(now + chrono::Duration::seconds(11)).await.unwrap(), 1);
        assert_eq!(store.queue_len("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promotion_emits_enqueued() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = broadcast::channel(8);
        let poller = Poller::new(store.clone(), Duration::from_secs(5)).with_events(tx);
        let now = Utc::now();

        let job = Job::new("default", "echo", vec![]);
        store
            .schedule_at(&StoredJob::encode(&job).unwrap(), None, now)
            .await
            .unwrap();
        let garbage = StoredJob {
            id: "garbage".to_string(),
            queue: "default".to_string(),
            payload: b"not json".to_vec(),
        };
        store.schedule_at(&garbage, None, now).await.unwrap();

        assert_eq!(poller.run_once(now).await.unwrap(), 2);
        let event = rx.recv().await.unwrap();
        assert_eq!((event.job_id, event.state), (job.id(), JobState::Enqueued));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_polling() {
        let store = Arc::new(MemoryStore::new());
        let mut poller = Poller::new(store.clone(), Duration::from_secs(1));

        let job = Job::new("default", "echo", vec![]);
        store
            .schedule_at(&StoredJob::encode(&job).unwrap(), None, Utc::now())
            .await
            .unwrap();

        poller.start().unwrap();
        assert!(poller.is_running());
        assert!(poller.start().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.queue_len("default").await.unwrap(), 1);

        poller.stop().await;
        assert!(!poller.is_running());
    }
}
