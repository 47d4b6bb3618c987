//! In-process store.
//!
//! Holds everything behind one mutex so each operation is atomic, and wakes
//! blocked `pop` calls through a [`Notify`]. Useful for tests and for running
//! producers and workers inside a single process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    ClaimedJob, DeadJob, QueueStore, StoredJob, lease_score, new_claim_token, score,
};
use crate::error::StoreResult;

struct Lease {
    expires: i64,
    token: String,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, StoredJob>,
    queues: HashMap<String, VecDeque<String>>,
    schedule: BTreeSet<(i64, String)>,
    schedule_scores: HashMap<String, i64>,
    in_flight: HashMap<String, Lease>,
    dead: VecDeque<DeadJob>,
}

impl State {
    fn unschedule(&mut self, id: &str) {
        if let Some(at) = self.schedule_scores.remove(id) {
            self.schedule.remove(&(at, id.to_string()));
        }
    }

    fn queue_of(&mut self, id: &str) -> Option<&mut VecDeque<String>> {
        let queue = self.jobs.get(id)?.queue.clone();
        Some(self.queues.entry(queue).or_default())
    }

    fn holds(&self, id: &str, token: &str) -> bool {
        self.in_flight.get(id).is_some_and(|lease| lease.token == token)
    }

    /// A missing token always passes; a present one must be the current claim.
    fn may_settle(&self, id: &str, claim: Option<&str>) -> bool {
        claim.is_none_or(|token| self.holds(id, token))
    }

    fn try_pop(&mut self, queues: &[String], lease: Duration) -> Option<ClaimedJob> {
        for name in queues {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };

            while let Some(id) = queue.pop_front() {
                if let Some(job) = self.jobs.get(&id) {
                    let claimed = ClaimedJob {
                        job: job.clone(),
                        token: new_claim_token(),
                    };
                    self.in_flight.insert(
                        id,
                        Lease {
                            expires: lease_score(lease),
                            token: claimed.token.clone(),
                        },
                    );
                    return Some(claimed);
                }
            }
        }
        None
    }
}

/// Store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, job: &StoredJob) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.jobs.insert(job.id.clone(), job.clone());
            state
                .queues
                .entry(job.queue.clone())
                .or_default()
                .push_back(job.id.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
        lease: Duration,
    ) -> StoreResult<Option<ClaimedJob>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register before checking so a push between the check and the
            // wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.state.lock().await.try_pop(queues, lease) {
                return Ok(Some(claimed));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn schedule_at(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let at = score(at);
        let mut state = self.state.lock().await;
        if !state.may_settle(&job.id, claim) {
            return Ok(false);
        }

        state.in_flight.remove(&job.id);
        state.unschedule(&job.id);
        state.jobs.insert(job.id.clone(), job.clone());
        state.schedule.insert((at, job.id.clone()));
        state.schedule_scores.insert(job.id.clone(), at);
        Ok(true)
    }

    async fn move_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<StoredJob>> {
        let now = score(now);
        let moved = {
            let mut state = self.state.lock().await;
            let due: Vec<(i64, String)> = state
                .schedule
                .iter()
                .take_while(|(at, _)| *at <= now)
                .cloned()
                .collect();

            let mut moved = Vec::with_capacity(due.len());
            for (at, id) in due {
                state.schedule.remove(&(at, id.clone()));
                state.schedule_scores.remove(&id);
                let Some(job) = state.jobs.get(&id).cloned() else {
                    continue;
                };
                if let Some(queue) = state.queue_of(&id) {
                    queue.push_back(id);
                    moved.push(job);
                }
            }
            moved
        };

        if !moved.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(moved)
    }

    async fn renew_lease(
        &self,
        id: &str,
        claim: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(id) {
            Some(lease) if lease.token == claim => {
                lease.expires = score(until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, id: &str, claim: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.holds(id, claim) {
            return Ok(false);
        }

        state.in_flight.remove(id);
        state.jobs.remove(id);
        Ok(true)
    }

    async fn bury(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.may_settle(&job.id, claim) {
            return Ok(false);
        }

        state.in_flight.remove(&job.id);
        state.unschedule(&job.id);
        state.jobs.remove(&job.id);
        state.dead.push_back(DeadJob {
            job: job.clone(),
            error: error.to_string(),
            died_at: super::from_score(score(at)),
        });

        while max_entries > 0 && state.dead.len() > max_entries {
            state.dead.pop_front();
        }
        Ok(true)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = score(now);
        let requeued = {
            let mut state = self.state.lock().await;
            let mut expired: Vec<(i64, String)> = state
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.expires <= now)
                .map(|(id, lease)| (lease.expires, id.clone()))
                .collect();
            // Latest expiry pushed first so the earliest ends up at the head
            expired.sort_by(|a, b| b.cmp(a));

            let mut requeued = 0;
            for (_, id) in expired {
                state.in_flight.remove(&id);
                if let Some(queue) = state.queue_of(&id) {
                    queue.push_front(id);
                    requeued += 1;
                }
            }
            requeued
        };

        if requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    async fn dead_jobs(&self, limit: usize) -> StoreResult<Vec<DeadJob>> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn queue_len(&self, queue: &str) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn scheduled_len(&self) -> StoreResult<usize> {
        Ok(self.state.lock().await.schedule.len())
    }

    async fn in_flight_len(&self) -> StoreResult<usize> {
        Ok(self.state.lock().await.in_flight.len())
    }

    async fn dead_len(&self) -> StoreResult<usize> {
        Ok(self.state.lock().await.dead.len())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    fn stored(id: &str, queue: &str) -> StoredJob {
        StoredJob {
            id: id.to_string(),
            queue: queue.to_string(),
            payload: id.as_bytes().to_vec(),
        }
    }

    fn names(queues: &[&str]) -> Vec<String> {
        queues.iter().map(|q| q.to_string()).collect()
    }

    async fn claim(store: &MemoryStore, queue: &str, lease: Duration) -> ClaimedJob {
        store
            .pop(&names(&[queue]), Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let store = MemoryStore::new();
        store.push(&stored("a", "default")).await.unwrap();
        store.push(&stored("b", "default")).await.unwrap();

        let first = claim(&store, "default", LEASE).await;
        let second = claim(&store, "default", LEASE).await;

        assert_eq!(first.job.id, "a");
        assert_eq!(second.job.id, "b");
        assert_ne!(first.token, second.token);
        assert_eq!(store.in_flight_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pop_checks_queues_in_order() {
        let store = MemoryStore::new();
        store.push(&stored("low", "low")).await.unwrap();
        store.push(&stored("high", "critical")).await.unwrap();

        let queues = names(&["critical", "low"]);
        let claimed = store.pop(&queues, Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, "high");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out() {
        let store = MemoryStore::new();

        let claimed = store
            .pop(&names(&["default"]), Duration::from_secs(2), LEASE)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .pop(&names(&["default"]), Duration::from_secs(5), LEASE)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push(&stored("late", "default")).await.unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.job.id, "late");
    }

    #[tokio::test]
    async fn test_lease_starts_when_job_is_claimed() {
        let store = Arc::new(MemoryStore::new());
        let lease = Duration::from_millis(900);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .pop(&names(&["default"]), Duration::from_secs(5), lease)
                    .await
            })
        };

        // Arrives after the lease length has already passed since the wait began
        tokio::time::sleep(Duration::from_millis(1000)).await;
        store.push(&stored("late", "default")).await.unwrap();
        waiter.await.unwrap().unwrap().unwrap();

        assert_eq!(store.requeue_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.in_flight_len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pops_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..100 {
            store.push(&stored(&format!("job-{i}"), "default")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .pop(&names(&["default"]), Duration::ZERO, LEASE)
                    .await
                    .unwrap()
                {
                    claimed.push(job.job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_move_due_moves_only_due_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.schedule_at(&stored("soon", "default"), None, now).await.unwrap();
        store
            .schedule_at(&stored("later", "default"), None, now + ChronoDuration::seconds(10))
            .await
            .unwrap();

        assert!(store.move_due(now - ChronoDuration::seconds(1)).await.unwrap().is_empty());
        assert_eq!(store.move_due(now).await.unwrap(), vec![stored("soon", "default")]);
        assert_eq!(store.queue_len("default").await.unwrap(), 1);
        assert_eq!(store.scheduled_len().await.unwrap(), 1);

        let moved = store.move_due(now + ChronoDuration::seconds(11)).await.unwrap();
        assert_eq!(moved, vec![stored("later", "default")]);
        assert_eq!(store.queue_len("default").await.unwrap(), 2);
        assert_eq!(store.scheduled_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_entry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = stored("a", "default");
        store.schedule_at(&job, None, now + ChronoDuration::seconds(5)).await.unwrap();
        store.schedule_at(&job, None, now + ChronoDuration::seconds(50)).await.unwrap();

        assert_eq!(store.scheduled_len().await.unwrap(), 1);
        assert!(store.move_due(now + ChronoDuration::seconds(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_and_renew() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.push(&stored("a", "default")).await.unwrap();
        let claimed = claim(&store, "default", Duration::from_secs(1)).await;

        assert!(!store.renew_lease("a", "not-mine", now).await.unwrap());
        assert!(
            store
                .renew_lease("a", &claimed.token, now + ChronoDuration::seconds(60))
                .await
                .unwrap()
        );
        assert_eq!(store.requeue_expired(now + ChronoDuration::seconds(2)).await.unwrap(), 0);

        assert!(!store.ack("a", "not-mine").await.unwrap());
        assert!(store.ack("a", &claimed.token).await.unwrap());
        assert!(!store.ack("a", &claimed.token).await.unwrap());
        assert!(!store.renew_lease("a", &claimed.token, now).await.unwrap());
        assert_eq!(store.in_flight_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_expired_puts_job_at_head() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.push(&stored("claimed", "default")).await.unwrap();
        store.push(&stored("waiting", "default")).await.unwrap();
        let first = claim(&store, "default", Duration::ZERO).await;

        assert_eq!(store.requeue_expired(now + ChronoDuration::seconds(5)).await.unwrap(), 1);
        assert!(!store.ack("claimed", &first.token).await.unwrap());

        let next = claim(&store, "default", LEASE).await;
        assert_eq!(next.job.id, "claimed");
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_settle_reclaimed_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = stored("a", "default");
        store.push(&job).await.unwrap();

        let stale = claim(&store, "default", Duration::ZERO).await;
        assert_eq!(store.requeue_expired(now + ChronoDuration::seconds(2)).await.unwrap(), 1);
        let current = claim(&store, "default", Duration::ZERO).await;

        assert!(!store.ack("a", &stale.token).await.unwrap());
        assert!(!store.renew_lease("a", &stale.token, now).await.unwrap());
        assert!(!store.schedule_at(&job, Some(&stale.token), now).await.unwrap());
        assert!(!store.bury(&job, Some(&stale.token), "boom", now, 0).await.unwrap());
        assert_eq!(store.scheduled_len().await.unwrap(), 0);
        assert_eq!(store.dead_len().await.unwrap(), 0);

        // The current holder crashes; the sweep still recovers the job
        assert_eq!(store.requeue_expired(now + ChronoDuration::hours(1)).await.unwrap(), 1);
        let recovered = claim(&store, "default", LEASE).await;
        assert_eq!(recovered.job, job);
        assert_ne!(recovered.token, current.token);
    }

    #[tokio::test]
    async fn test_schedule_with_claim_releases_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = stored("a", "default");
        store.push(&job).await.unwrap();
        let claimed = claim(&store, "default", LEASE).await;

        assert!(store.schedule_at(&job, Some(&claimed.token), now).await.unwrap());
        assert_eq!(store.in_flight_len().await.unwrap(), 0);
        assert_eq!(store.scheduled_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bury_evicts_oldest() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            assert!(store.bury(&stored(id, "default"), None, "boom", now, 2).await.unwrap());
        }

        let dead: Vec<String> = store
            .dead_jobs(10)
            .await
            .unwrap()
            .into_iter()
            .map(|dead| dead.job.id)
            .collect();
        assert_eq!(dead, vec!["b", "c"]);
        assert_eq!(store.dead_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bury_records_reason_and_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = stored("a", "default");
        store.push(&job).await.unwrap();
        let claimed = claim(&store, "default", LEASE).await;

        assert!(
            store
                .bury(&job, Some(&claimed.token), "unsupported envelope version", now, 0)
                .await
                .unwrap()
        );
        assert_eq!(store.in_flight_len().await.unwrap(), 0);

        let dead = store.dead_jobs(1).await.unwrap();
        assert_eq!(dead[0].job, job);
        assert_eq!(dead[0].error, "unsupported envelope version");
        assert_eq!(dead[0].died_at.timestamp_millis(), now.timestamp_millis());
    }
}
