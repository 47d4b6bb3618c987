//! Durable storage for queued, scheduled, in-flight and dead jobs.
//!
//! The store knows nothing about envelopes beyond the id and queue it needs
//! for routing; payloads are opaque bytes produced by
//! [`JobCodec`](crate::codec::JobCodec). Every operation is atomic with
//! respect to every other operation on the same store, which is what makes a
//! claim exclusive across processes.
//!
//! Each `pop` hands out a fresh claim token. Operations that settle a claimed
//! job (`ack`, `renew_lease`, and `schedule_at`/`bury` when given a token) only
//! take effect while that token is still the job's current claim, so a slot
//! whose lease expired and was handed to another slot cannot touch the job.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::codec::{CodecError, JobCodec};
use crate::error::StoreResult;
use crate::job::Job;
use crate::retry::after;

/// A job as the store sees it: routing information plus the encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    /// Job id
    pub id: String,
    /// Queue the job belongs to
    pub queue: String,
    /// Encoded envelope
    pub payload: Vec<u8>,
}

impl StoredJob {
    /// Encode an envelope for storage.
    pub fn encode(job: &Job) -> Result<Self, CodecError> {
        Ok(Self {
            id: job.id().to_string(),
            queue: job.queue.clone(),
            payload: JobCodec::encode(job)?,
        })
    }

    /// Decode the stored envelope.
    pub fn decode(&self) -> Result<Job, CodecError> {
        JobCodec::decode(&self.payload)
    }
}

/// A job returned by [`QueueStore::pop`] with the token proving the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    /// The claimed job
    pub job: StoredJob,
    /// Claim token, unique per `pop`
    pub token: String,
}

/// An entry of the dead set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadJob {
    /// The buried job
    pub job: StoredJob,
    /// Why it was buried
    pub error: String,
    /// When it was buried, to the millisecond
    pub died_at: DateTime<Utc>,
}

/// Storage backend for the queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a job to the tail of its queue.
    async fn push(&self, job: &StoredJob) -> StoreResult<()>;

    /// Claim the head of the first non-empty queue, waiting up to `timeout`.
    ///
    /// Queues are checked in the order given. The claimed job is recorded as
    /// in flight until `lease` after the moment it is claimed.
    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
        lease: Duration,
    ) -> StoreResult<Option<ClaimedJob>>;

    /// Store a job in the scheduled set to run at `at`.
    ///
    /// With a claim token, acts only while that claim is held and releases
    /// it; returns false and changes nothing otherwise. Without one, always
    /// writes.
    async fn schedule_at(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Move every scheduled job due at `now` to the tail of its queue.
    ///
    /// Returns the moved jobs in due order.
    async fn move_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<StoredJob>>;

    /// Extend a held lease. Returns false if the claim is no longer held.
    async fn renew_lease(&self, id: &str, claim: &str, until: DateTime<Utc>)
    -> StoreResult<bool>;

    /// Drop a finished job. Returns false if the claim was no longer held.
    async fn ack(&self, id: &str, claim: &str) -> StoreResult<bool>;

    /// Append a job to the dead set, keeping at most `max_entries` (0 keeps all).
    ///
    /// The claim token works as in [`schedule_at`](Self::schedule_at).
    async fn bury(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<bool>;

    /// Put every job whose lease expired before `now` back at the head of its queue.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Dead jobs, oldest first.
    async fn dead_jobs(&self, limit: usize) -> StoreResult<Vec<DeadJob>>;

    /// Number of ready jobs in a queue.
    async fn queue_len(&self, queue: &str) -> StoreResult<usize>;

    /// Number of scheduled jobs.
    async fn scheduled_len(&self) -> StoreResult<usize>;

    /// Number of claimed jobs.
    async fn in_flight_len(&self) -> StoreResult<usize>;

    /// Number of dead jobs.
    async fn dead_len(&self) -> StoreResult<usize>;

    /// Check that the store answers.
    async fn ping(&self) -> StoreResult<()>;
}

/// Milliseconds since the Unix epoch, the score unit of every sorted set.
pub(crate) fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`score`].
pub(crate) fn from_score(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Lease expiry score for a claim made now.
pub(crate) fn lease_score(lease: Duration) -> i64 {
    score(after(Utc::now(), lease))
}

pub(crate) fn new_claim_token() -> String {
    Uuid::new_v4().to_string()
}
