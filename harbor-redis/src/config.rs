//! Redis connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::{Namespace, RedisError, Result};

/// Redis connection configuration.
///
/// The namespace is not part of the Redis protocol; it is a prefix that every
/// key built through [`Namespace`] carries, so several tenants can share one
/// Redis database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (`redis://host:port/db` or `rediss://` for TLS).
    pub url: String,
    /// Maximum number of pooled connections.
    pub pool_size: u32,
    /// Minimum idle connections kept open.
    pub min_idle: Option<u32>,
    /// Time allowed to check out a connection before failing, e.g. `"5s"`.
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Logical database index. Overrides the index in the URL path.
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Key prefix applied to every key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_namespace() -> String {
    "harbor".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            pool_size: 10,
            min_idle: None,
            connection_timeout: default_connection_timeout(),
            database: None,
            username: None,
            password: None,
            namespace: default_namespace(),
        }
    }
}

impl RedisConfig {
    /// Create a configuration for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Start a builder from `REDIS_*` environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(pool_size) = std::env::var("REDIS_POOL_SIZE")
            && let Ok(size) = pool_size.parse()
        {
            builder = builder.pool_size(size);
        }

        if let Ok(db) = std::env::var("REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = std::env::var("REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        if let Ok(namespace) = std::env::var("REDIS_NAMESPACE") {
            builder = builder.namespace(namespace);
        }

        builder
    }

    /// Parse and check the URL.
    pub fn parsed_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| RedisError::Config(format!("invalid Redis URL '{}': {}", self.url, e)))?;

        match url.scheme() {
            "redis" | "rediss" => {}
            other => {
                return Err(RedisError::Config(format!(
                    "unsupported URL scheme '{}', expected redis or rediss",
                    other
                )));
            }
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(RedisError::Config(format!("Redis URL '{}' has no host", self.url)));
        }

        Ok(url)
    }

    /// The logical database index, from `database` or else the URL path.
    pub fn database_index(&self) -> Result<u8> {
        if let Some(db) = self.database {
            return Ok(db);
        }

        let url = self.parsed_url()?;
        let path = url.path().trim_matches('/');
        if path.is_empty() {
            return Ok(0);
        }

        path.parse()
            .map_err(|_| RedisError::Config(format!("invalid database index '{}'", path)))
    }

    /// Full URL with credentials and database applied.
    pub fn connection_url(&self) -> Result<String> {
        let mut url = self.parsed_url()?;

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| RedisError::Config("cannot set username on Redis URL".to_string()))?;
        }

        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| RedisError::Config("cannot set password on Redis URL".to_string()))?;
        }

        let db = self.database_index()?;
        url.set_path(&format!("/{}", db));

        Ok(url.to_string())
    }

    /// Key builder for this configuration's namespace.
    pub fn key_namespace(&self) -> Namespace {
        Namespace::new(&self.namespace)
    }
}

/// Builder for [`RedisConfig`].
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the minimum idle connections.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Set the connection checkout timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the key namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}
