//! Redis-backed store.
//!
//! Keys, all under the configured namespace:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `job:<id>` | hash | `queue`, `payload`; `claim` while in flight; `error`, `died_at` once dead |
//! | `queue:<name>` | list | ready job ids, head first |
//! | `queues` | set | every queue name seen |
//! | `schedule` | sorted set | job ids scored by run time (ms) |
//! | `inflight` | sorted set | job ids scored by lease expiry (ms) |
//! | `dead` | list | dead job ids, oldest first |
//!
//! Each operation is a single Lua script so it runs atomically on the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harbor_redis::RedisService;
use redis::Script;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{
    ClaimedJob, DeadJob, QueueStore, StoredJob, from_score, lease_score, new_claim_token, score,
};
use crate::error::StoreResult;

/// Delay between empty `pop` attempts while waiting for work.
const POP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const PUSH: &str = r"
redis.call('HSET', KEYS[1], 'queue', ARGV[2], 'payload', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
";

// KEYS[1] inflight, KEYS[2..] queues in priority order
// ARGV[1] lease score, ARGV[2] job key prefix, ARGV[3] claim token
const POP: &str = r"
for i = 2, #KEYS do
  local id = redis.call('LPOP', KEYS[i])
  while id do
    local key = ARGV[2] .. id
    local fields = redis.call('HMGET', key, 'queue', 'payload')
    if fields[2] then
      redis.call('ZADD', KEYS[1], ARGV[1], id)
      redis.call('HSET', key, 'claim', ARGV[3])
      return {id, fields[1] or '', fields[2]}
    end
    id = redis.call('LPOP', KEYS[i])
  end
end
return nil
";

// Shared guard: an empty token always passes, otherwise the job must be in
// flight under that token. KEYS[1] job, KEYS[3] inflight, ARGV[1] id.
const HOLDS_CLAIM: &str = r"
local function holds(token)
  if token == '' then
    return true
  end
  return redis.call('ZSCORE', KEYS[3], ARGV[1]) and redis.call('HGET', KEYS[1], 'claim') == token
end
";

// KEYS[1] job, KEYS[2] schedule, KEYS[3] inflight
// ARGV[1] id, ARGV[2] queue, ARGV[3] payload, ARGV[4] run at, ARGV[5] claim
const SCHEDULE: &str = r"
if not holds(ARGV[5]) then
  return 0
end
redis.call('HSET', KEYS[1], 'queue', ARGV[2], 'payload', ARGV[3])
redis.call('HDEL', KEYS[1], 'claim')
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
return 1
";

// KEYS[1] schedule, KEYS[2] queues set
// ARGV[1] now, ARGV[2] namespace prefix
const MOVE_DUE: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local fields = redis.call('HMGET', ARGV[2] .. 'job:' .. id, 'queue', 'payload')
  if fields[1] and fields[2] then
    redis.call('SADD', KEYS[2], fields[1])
    redis.call('RPUSH', ARGV[2] .. 'queue:' .. fields[1], id)
    table.insert(moved, {id, fields[1], fields[2]})
  end
end
return moved
";

// Walks expiries newest first so the oldest claim ends up at the head.
const REQUEUE_EXPIRED: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local requeued = 0
for i = #ids, 1, -1 do
  local id = ids[i]
  local key = ARGV[2] .. 'job:' .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', key, 'claim')
  local queue = redis.call('HGET', key, 'queue')
  if queue then
    redis.call('LPUSH', ARGV[2] .. 'queue:' .. queue, id)
    requeued = requeued + 1
  end
end
return requeued
";

// KEYS[1] inflight, KEYS[2] job; ARGV[1] id, ARGV[2] claim, ARGV[3] lease score
const RENEW: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) and redis.call('HGET', KEYS[2], 'claim') == ARGV[2] then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
  return 1
end
return 0
";

// KEYS[1] inflight, KEYS[2] job; ARGV[1] id, ARGV[2] claim
const ACK: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) and redis.call('HGET', KEYS[2], 'claim') == ARGV[2] then
  redis.call('ZREM', KEYS[1], ARGV[1])
  redis.call('DEL', KEYS[2])
  return 1
end
return 0
";

// KEYS[1] job, KEYS[2] dead, KEYS[3] inflight, KEYS[4] schedule
// ARGV[1] id, ARGV[2] queue, ARGV[3] payload, ARGV[4] died at,
// ARGV[5] max entries, ARGV[6] job key prefix, ARGV[7] claim, ARGV[8] error
const BURY: &str = r"
if not holds(ARGV[7]) then
  return 0
end
redis.call('HSET', KEYS[1], 'queue', ARGV[2], 'payload', ARGV[3], 'died_at', ARGV[4], 'error', ARGV[8])
redis.call('HDEL', KEYS[1], 'claim')
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
local max = tonumber(ARGV[5])
if max > 0 then
  while redis.call('LLEN', KEYS[2]) > max do
    local old = redis.call('LPOP', KEYS[2])
    redis.call('DEL', ARGV[6] .. old)
  end
end
return 1
";

const DEAD: &str = r"
local ids = redis.call('LRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
local out = {}
for _, id in ipairs(ids) do
  local fields = redis.call('HMGET', ARGV[2] .. id, 'queue', 'payload', 'died_at', 'error')
  if fields[2] then
    table.insert(out, {id, fields[1] or '', fields[2], fields[3] or '0', fields[4] or ''})
  end
end
return out
";

struct Scripts {
    push: Script,
    pop: Script,
    schedule: Script,
    move_due: Script,
    requeue_expired: Script,
    renew: Script,
    ack: Script,
    bury: Script,
    dead: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            push: Script::new(PUSH),
            pop: Script::new(POP),
            schedule: Script::new(&format!("{}{}", HOLDS_CLAIM, SCHEDULE)),
            move_due: Script::new(MOVE_DUE),
            requeue_expired: Script::new(REQUEUE_EXPIRED),
            renew: Script::new(RENEW),
            ack: Script::new(ACK),
            bury: Script::new(&format!("{}{}", HOLDS_CLAIM, BURY)),
            dead: Script::new(DEAD),
        }
    }
}

type Row = (String, String, Vec<u8>);
type DeadRow = (String, String, Vec<u8>, i64, String);

fn into_stored((id, queue, payload): Row) -> StoredJob {
    StoredJob { id, queue, payload }
}

fn into_dead((id, queue, payload, died_at, error): DeadRow) -> DeadJob {
    DeadJob {
        job: StoredJob { id, queue, payload },
        error,
        died_at: from_score(died_at),
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    redis: RedisService,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a store on top of a connected service.
    pub fn new(redis: RedisService) -> Self {
        Self {
            redis,
            scripts: Scripts::load(),
        }
    }

    /// The underlying service.
    pub fn service(&self) -> &RedisService {
        &self.redis
    }

    fn job_key(&self, id: &str) -> String {
        self.redis.key(&format!("job:{}", id))
    }

    fn queue_key(&self, queue: &str) -> String {
        self.redis.key(&format!("queue:{}", queue))
    }

    fn prefix(&self) -> &str {
        self.redis.namespace().prefix()
    }

    async fn try_pop(
        &self,
        queues: &[String],
        lease: Duration,
    ) -> StoreResult<Option<ClaimedJob>> {
        let token = new_claim_token();
        let mut invocation = self.scripts.pop.key(self.redis.key("inflight"));
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation
            .arg(lease_score(lease))
            .arg(self.job_key(""))
            .arg(&token);

        let mut conn = self.redis.get().await?;
        let row: Option<Row> = invocation.invoke_async(&mut *conn).await?;
        Ok(row.map(|row| ClaimedJob {
            job: into_stored(row),
            token,
        }))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, job: &StoredJob) -> StoreResult<()> {
        let mut conn = self.redis.get().await?;
        let _: i64 = self
            .scripts
            .push
            .key(self.job_key(&job.id))
            .key(self.queue_key(&job.queue))
            .key(self.redis.key("queues"))
            .arg(&job.id)
            .arg(&job.queue)
            .arg(job.payload.as_slice())
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
        lease: Duration,
    ) -> StoreResult<Option<ClaimedJob>> {
        if queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(claimed) = self.try_pop(queues, lease).await? {
                return Ok(Some(claimed));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POP_RETRY_INTERVAL)).await;
        }
    }

    async fn schedule_at(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.get().await?;
        let scheduled: i64 = self
            .scripts
            .schedule
            .key(self.job_key(&job.id))
            .key(self.redis.key("schedule"))
            .key(self.redis.key("inflight"))
            .arg(&job.id)
            .arg(&job.queue)
            .arg(job.payload.as_slice())
            .arg(score(at))
            .arg(claim.unwrap_or_default())
            .invoke_async(&mut *conn)
            .await?;
        Ok(scheduled == 1)
    }

    async fn move_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<StoredJob>> {
        let mut conn = self.redis.get().await?;
        let rows: Vec<Row> = self
            .scripts
            .move_due
            .key(self.redis.key("schedule"))
            .key(self.redis.key("queues"))
            .arg(score(now))
            .arg(self.prefix())
            .invoke_async(&mut *conn)
            .await?;

        if !rows.is_empty() {
            debug!(moved = rows.len(), namespace = %self.redis.namespace(), "Moved due jobs to their queues");
        }
        Ok(rows.into_iter().map(into_stored).collect())
    }

    async fn renew_lease(
        &self,
        id: &str,
        claim: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.get().await?;
        let renewed: i64 = self
            .scripts
            .renew
            .key(self.redis.key("inflight"))
            .key(self.job_key(id))
            .arg(id)
            .arg(claim)
            .arg(score(until))
            .invoke_async(&mut *conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn ack(&self, id: &str, claim: &str) -> StoreResult<bool> {
        let mut conn = self.redis.get().await?;
        let acked: i64 = self
            .scripts
            .ack
            .key(self.redis.key("inflight"))
            .key(self.job_key(id))
            .arg(id)
            .arg(claim)
            .invoke_async(&mut *conn)
            .await?;
        Ok(acked == 1)
    }

    async fn bury(
        &self,
        job: &StoredJob,
        claim: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.get().await?;
        let buried: i64 = self
            .scripts
            .bury
            .key(self.job_key(&job.id))
            .key(self.redis.key("dead"))
            .key(self.redis.key("inflight"))
            .key(self.redis.key("schedule"))
            .arg(&job.id)
            .arg(&job.queue)
            .arg(job.payload.as_slice())
            .arg(score(at))
            .arg(max_entries)
            .arg(self.job_key(""))
            .arg(claim.unwrap_or_default())
            .arg(error)
            .invoke_async(&mut *conn)
            .await?;
        Ok(buried == 1)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.redis.get().await?;
        let requeued: usize = self
            .scripts
            .requeue_expired
            .key(self.redis.key("inflight"))
            .arg(score(now))
            .arg(self.prefix())
            .invoke_async(&mut *conn)
            .await?;
        Ok(requeued)
    }

    async fn dead_jobs(&self, limit: usize) -> StoreResult<Vec<DeadJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.get().await?;
        let rows: Vec<DeadRow> = self
            .scripts
            .dead
            .key(self.redis.key("dead"))
            .arg(limit)
            .arg(self.job_key(""))
            .invoke_async(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(into_dead).collect())
    }

    async fn queue_len(&self, queue: &str) -> StoreResult<usize> {
        Ok(self
            .redis
            .query(redis::cmd("LLEN").arg(self.queue_key(queue)))
            .await?)
    }

    async fn scheduled_len(&self) -> StoreResult<usize> {
        Ok(self
            .redis
            .query(redis::cmd("ZCARD").arg(self.redis.key("schedule")))
            .await?)
    }

    async fn in_flight_len(&self) -> StoreResult<usize> {
        Ok(self
            .redis
            .query(redis::cmd("ZCARD").arg(self.redis.key("inflight")))
            .await?)
    }

    async fn dead_len(&self) -> StoreResult<usize> {
        Ok(self
            .redis
            .query(redis::cmd("LLEN").arg(self.redis.key("dead")))
            .await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(self.redis.health_check().await?)
    }
}
