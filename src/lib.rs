// Harbor - Durable background jobs for Rust
//
// This library provides Redis-backed job queues with worker pools, retries with
// backoff, scheduled jobs and a dead-letter set.

// Re-export the job system
pub use harbor_queue::*;

// Re-export the Redis layer
pub use harbor_redis;
pub use harbor_redis::{Namespace, RedisConfig, RedisError, RedisService};

pub mod logging;

pub use logging::{LogConfig, LogFormat};
