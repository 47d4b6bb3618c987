//! Recovers jobs whose worker died or stalled past its lease.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{QueueError, QueueResult};
use crate::poller::jittered;
use crate::store::QueueStore;

/// Periodically puts expired in-flight jobs back at the head of their queue.
///
/// A job can be recovered while its original worker is still running it, so
/// handlers see at-least-once delivery.
pub struct LeaseSweeper {
    store: Arc<dyn QueueStore>,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    /// Create a sweeper.
    pub fn new(store: Arc<dyn QueueStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            handle: None,
        }
    }

    /// Requeue every job whose lease expired by `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        Ok(self.store.requeue_expired(now).await?)
    }

    /// Start sweeping in the background.
    pub fn start(&mut self) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::Other("lease sweeper already running".to_string()));
        }

        let store = Arc::clone(&self.store);
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                match store.requeue_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(requeued) => warn!(requeued, "Requeued jobs with expired leases"),
                    Err(e) => warn!(error = %e, "Lease sweep failed"),
                }
            }
        }));

        info!(interval = ?self.interval, "Lease sweeper started");
        Ok(())
    }

    /// Stop sweeping.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Check if the sweeper is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredJob};

    #[tokio::test]
    async fn test_expired_lease_is_requeued_at_head() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = LeaseSweeper::new(store.clone(), Duration::from_secs(30));
        let now = Utc::now();
        let queues = vec!["default".to_string()];

        for id in ["first", "second"] {
            store
                .push(&StoredJob {
                    id: id.into(),
                    queue: "default".into(),
                    payload: b"{}".to_vec(),
                })
                .await
                .unwrap();
        }
        store
            .pop(&queues, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(sweeper.run_once(now).await.unwrap(), 0);
        assert_eq!(
            sweeper.run_once(now + chrono::Duration::seconds(61)).await.unwrap(),
            1
        );

        let head = store
            .pop(&queues, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.job.id, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop() {
        let store = Arc::new(MemoryStore::new());
        let mut sweeper = LeaseSweeper::new(store, Duration::from_secs(1));

        sweeper.start().unwrap();
        assert!(sweeper.is_running());
        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }
}
