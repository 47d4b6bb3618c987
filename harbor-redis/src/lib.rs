//! # Harbor Redis
//!
//! Redis plumbing for Harbor: a bb8 connection pool, namespaced keys and a
//! cloneable service that the queue store runs its commands and scripts on.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use harbor_redis::{RedisConfig, RedisService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), harbor_redis::RedisError> {
//!     let config = RedisConfig::builder()
//!         .url("redis://127.0.0.1:6379/1")
//!         .namespace("exq")
//!         .pool_size(1)
//!         .build();
//!
//!     let service = RedisService::new(config).await?;
//!     let len: usize = service.query(redis::cmd("LLEN").arg(service.key("queue:default"))).await?;
//!     println!("{} jobs waiting", len);
//!     Ok(())
//! }
//! ```
//!
//! ## Keys
//!
//! ```
//! use harbor_redis::Namespace;
//!
//! let ns = Namespace::new("exq");
//! assert_eq!(ns.key("schedule"), "exq:schedule");
//! ```

mod config;
mod error;
mod namespace;
mod pool;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use namespace::Namespace;
pub use pool::{RedisConnection, RedisPool, RedisPoolBuilder};
pub use service::{PoolStats, RedisService};

// Re-export redis crate for convenience
pub use redis;
