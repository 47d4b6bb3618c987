//! Durable background jobs with at-least-once execution.
//!
//! Provides a job queue system with:
//! - 📦 Redis-backed persistence (one atomic Lua script per operation)
//! - 🧪 An in-memory store for tests and single-process setups
//! - 🔄 Automatic retries with exponential backoff
//! - ⭐ Prioritised queues
//! - ⏰ Delayed/scheduled jobs
//! - 💀 Dead letter set
//! - 🔒 Leases with heartbeat renewal and expired-lease recovery
//! - 👷 Worker pools
//!
//! ## Quick Start - Job Creation
//!
//! ```
//! use harbor_queue::Job;
//! use serde_json::json;
//!
//! let job = Job::new("emails", "send_welcome", vec![json!("user@example.com")]);
//!
//! assert_eq!(job.queue, "emails");
//! assert_eq!(job.job_type, "send_welcome");
//! assert_eq!(job.retry_count(), 0);
//! ```
//!
//! ## Wire Format
//!
//! ```
//! use harbor_queue::{Job, JobCodec};
//!
//! let job = Job::new("default", "echo", vec!["hi".into()]);
//! let bytes = JobCodec::encode(&job).unwrap();
//! assert_eq!(JobCodec::decode(&bytes).unwrap(), job);
//! ```
//!
//! ## Retry Schedule
//!
//! ```
//! use harbor_queue::{Backoff, RetryPolicy};
//! use std::time::Duration;
//! use uuid::Uuid;
//!
//! let policy = RetryPolicy::new(5);
//! let id = Uuid::from_u128(0);
//!
//! assert_eq!(policy.backoff.delay(0, id), Duration::from_secs(15));
//! assert_eq!(policy.backoff.delay(1, id), Duration::from_secs(30));
//! assert_eq!(Backoff::Fixed(Duration::from_secs(1)).delay(9, id), Duration::from_secs(1));
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use harbor_queue::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let config = Config::from_env()?;
//!
//!     // Enqueue a job
//!     let client = Client::connect(&config).await?;
//!     client.enqueue("default", "send_email", vec![json!("user@example.com")]).await?;
//!
//!     // Process jobs
//!     let mut registry = HandlerRegistry::new();
//!     registry.register_fn("send_email", |args| async move {
//!         println!("Sending email to {:?}", args);
//!         Ok(())
//!     });
//!
//!     let server = Server::connect(config, registry).await?;
//!     server
//!         .run_until_shutdown(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod poller;
pub mod retry;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use client::Client;
pub use codec::{CodecError, ENVELOPE_VERSION, JobCodec};
pub use config::{Config, QueueSpec};
pub use error::{QueueError, QueueResult, StoreError, StoreResult};
pub use handler::{FnHandler, Handler, HandlerRegistry};
pub use job::{Job, JobArgs, JobEvent, JobId, JobState};
pub use poller::Poller;
pub use retry::{Backoff, FailureOutcome, RetryManager, RetryPolicy};
pub use server::Server;
pub use store::{ClaimedJob, DeadJob, MemoryStore, QueueStore, RedisStore, StoredJob};
pub use sweeper::LeaseSweeper;
pub use worker::{Processor, Worker, WorkerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::config::{Config, QueueSpec};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::handler::{Handler, HandlerRegistry};
    pub use crate::job::{Job, JobArgs, JobEvent, JobId, JobState};
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::server::Server;
    pub use crate::store::{MemoryStore, QueueStore, RedisStore};
    pub use crate::worker::{Worker, WorkerConfig};
}
