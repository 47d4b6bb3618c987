//! Pooled Redis service shared by store components.

use std::sync::Arc;

use crate::{
    Namespace, RedisConfig, Result,
    pool::{RedisConnection, RedisPool, RedisPoolBuilder},
};

/// Redis service holding the connection pool and the key namespace.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct RedisService {
    config: Arc<RedisConfig>,
    namespace: Namespace,
    pool: RedisPool,
}

impl RedisService {
    /// Connect and build the pool.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone()).build().await?;
        Ok(Self::from_pool(config, pool))
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        let namespace = config.key_namespace();
        Self {
            config: Arc::new(config),
            namespace,
            pool,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Key namespace for this service.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Build a namespaced key.
    pub fn key(&self, suffix: &str) -> String {
        self.namespace.key(suffix)
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection::from(conn))
    }

    /// Run a single command on a pooled connection.
    pub async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.get().await?;
        let value: T = cmd.query_async(&mut *conn).await?;
        Ok(value)
    }

    /// Check if the server answers `PING`.
    pub async fn health_check(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_ping_and_namespace() {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379/15")
            .namespace("harbor-test")
            .pool_size(2)
            .build();

        let redis = RedisService::new(config).await.unwrap();
        redis.health_check().await.unwrap();
        assert_eq!(redis.key("dead"), "harbor-test:dead");
        assert!(redis.pool_stats().connections >= 1);
    }
}
