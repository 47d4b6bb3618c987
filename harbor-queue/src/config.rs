//! Queue configuration.
//!
//! A [`Config`] can come from a TOML file, from `HARBOR_*` environment
//! variables, or from code. Every field has a default, so an empty file is a
//! valid configuration.
//!
//! ```
//! use harbor_queue::Config;
//!
//! let config = Config::from_toml_str(r#"
//!     concurrency = 4
//!     namespace = "exq"
//!     store_url = "redis://127.0.0.1:6379/1"
//!
//!     [[queues]]
//!     name = "critical"
//!     priority = 3
//!
//!     [[queues]]
//!     name = "default"
//! "#).unwrap();
//!
//! assert_eq!(config.ordered_queues(), vec!["critical", "default"]);
//! ```

use harbor_redis::RedisConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

/// A queue to fetch from and its relative priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Higher is fetched first
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    1
}

impl QueueSpec {
    /// Create a queue entry.
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Server and client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker slots per process
    pub concurrency: usize,
    /// Queues to fetch from
    pub queues: Vec<QueueSpec>,
    /// Retries before a job is declared dead
    pub max_retries: u32,
    /// Claim lifetime without renewal
    pub lease_seconds: u64,
    /// Average scheduled-set poll interval
    pub poll_interval_ms: u64,
    /// Redis URL including the database index
    pub store_url: String,
    /// Key prefix
    pub namespace: String,
    /// Longest a handler may run
    pub job_timeout_seconds: u64,
    /// Longest a worker slot blocks on an empty queue
    pub fetch_timeout_ms: u64,
    /// Average interval between expired-lease sweeps
    pub sweep_interval_ms: u64,
    /// Grace period for running jobs on stop
    pub shutdown_timeout_seconds: u64,
    /// Dead set capacity, 0 for unbounded
    pub dead_max_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![QueueSpec::new("default", 1)],
            max_retries: 25,
            lease_seconds: 60,
            poll_interval_ms: 5000,
            store_url: "redis://127.0.0.1:6379/0".to_string(),
            namespace: "harbor".to_string(),
            job_timeout_seconds: 300,
            fetch_timeout_ms: 2000,
            sweep_interval_ms: 30_000,
            shutdown_timeout_seconds: 25,
            dead_max_jobs: 10_000,
        }
    }
}

impl Config {
    /// Parse and validate TOML.
    pub fn from_toml_str(content: &str) -> QueueResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| QueueError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `HARBOR_*` environment variables.
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `HARBOR_*` environment variables.
    pub fn apply_env(&mut self) -> QueueResult<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override fields from variables resolved by `lookup`.
    ///
    /// `HARBOR_STORE_URL` falls back to `REDIS_URL`. `HARBOR_QUEUES` is a
    /// comma-separated list of `name` or `name:priority`.
    pub fn apply_vars<F>(&mut self, lookup: F) -> QueueResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HARBOR_CONCURRENCY") {
            self.concurrency = parse_var("HARBOR_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("HARBOR_QUEUES") {
            self.queues = parse_queues(&v)?;
        }
        if let Some(v) = lookup("HARBOR_MAX_RETRIES") {
            self.max_retries = parse_var("HARBOR_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("HARBOR_LEASE_SECONDS") {
            self.lease_seconds = parse_var("HARBOR_LEASE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_var("HARBOR_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_STORE_URL").or_else(|| lookup("REDIS_URL")) {
            self.store_url = v;
        }
        if let Some(v) = lookup("HARBOR_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("HARBOR_JOB_TIMEOUT_SECONDS") {
            self.job_timeout_seconds = parse_var("HARBOR_JOB_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = parse_var("HARBOR_FETCH_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = parse_var("HARBOR_SWEEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_SHUTDOWN_TIMEOUT_SECONDS") {
            self.shutdown_timeout_seconds = parse_var("HARBOR_SHUTDOWN_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HARBOR_DEAD_MAX_JOBS") {
            self.dead_max_jobs = parse_var("HARBOR_DEAD_MAX_JOBS", &v)?;
        }
        Ok(())
    }

    /// Check the configuration for values the server cannot run with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.queues.is_empty() {
            return Err(QueueError::Config("at least one queue is required".into()));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(QueueError::Config("queue names must not be blank".into()));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(QueueError::Config(format!(
                    "queue '{}' is listed twice",
                    queue.name
                )));
            }
        }

        for (name, value) in [
            ("lease_seconds", self.lease_seconds),
            ("poll_interval_ms", self.poll_interval_ms),
            ("job_timeout_seconds", self.job_timeout_seconds),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(QueueError::Config(format!("{} must be greater than 0", name)));
            }
        }

        // A claim made at the end of a fetch wait must not already be stale.
        if self.fetch_timeout_ms >= self.lease_seconds.saturating_mul(1000) {
            return Err(QueueError::Config(format!(
                "fetch_timeout_ms ({}) must be shorter than the lease ({}s)",
                self.fetch_timeout_ms, self.lease_seconds
            )));
        }

        RedisConfig::new(&self.store_url).database_index()?;
        Ok(())
    }

    /// Queue names, highest priority first; ties keep their listed order.
    pub fn ordered_queues(&self) -> Vec<String> {
        let mut queues: Vec<&QueueSpec> = self.queues.iter().collect();
        queues.sort_by(|a, b| b.priority.cmp(&a.priority));
        queues.into_iter().map(|q| q.name.clone()).collect()
    }

    /// Claim lifetime.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    /// Scheduled-set poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Expired-lease sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Retry budget with the default delay curve.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    /// Worker settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            queues: self.ordered_queues(),
            lease: self.lease(),
            job_timeout: Duration::from_secs(self.job_timeout_seconds),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            retry: self.retry_policy(),
            dead_max_jobs: self.dead_max_jobs,
        }
    }

    /// Redis settings for a pool of `pool_size` connections.
    pub fn redis_config(&self, pool_size: u32) -> RedisConfig {
        RedisConfig::builder()
            .url(&self.store_url)
            .namespace(&self.namespace)
            .pool_size(pool_size)
            .build()
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> QueueResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| QueueError::Config(format!("invalid {}='{}': {}", name, value, e)))
}

fn parse_queues(value: &str) -> QueueResult<Vec<QueueSpec>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> QueueResult<QueueSpec> {
            match entry.split_once(':') {
                Some((name, priority)) => Ok(QueueSpec::new(
                    name.trim(),
                    parse_var("HARBOR_QUEUES", priority)?,
                )),
                None => Ok(QueueSpec::new(entry, default_priority())),
            }
        })
        .collect()
}
