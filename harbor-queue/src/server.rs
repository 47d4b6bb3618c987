//! Server process: worker pool, scheduled-job poller and lease sweeper
//! assembled from one [`Config`].

use harbor_redis::RedisService;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::client::Client;
use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerRegistry;
use crate::job::JobEvent;
use crate::poller::Poller;
use crate::store::{QueueStore, RedisStore};
use crate::sweeper::LeaseSweeper;
use crate::worker::Worker;

/// A running job server.
///
/// # Examples
///
/// ```no_run
/// use harbor_queue::{Config, HandlerRegistry, Server};
///
/// # async fn example() -> harbor_queue::QueueResult<()> {
/// let mut registry = HandlerRegistry::new();
/// registry.register_fn("echo", |args| async move {
///     println!("{:?}", args);
///     Ok(())
/// });
///
/// let server = Server::connect(Config::from_env()?, registry).await?;
/// server
///     .run_until_shutdown(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    store: Arc<dyn QueueStore>,
    worker: Worker,
    poller: Poller,
    sweeper: LeaseSweeper,
}

impl Server {
    /// Connect to Redis and build the server.
    ///
    /// The pool holds one connection per worker slot plus one each for the
    /// poller and the sweeper.
    pub async fn connect(config: Config, registry: HandlerRegistry) -> QueueResult<Self> {
        config.validate()?;

        let pool_size = u32::try_from(config.concurrency.saturating_add(2))
            .map_err(|_| QueueError::Config("concurrency is too large".to_string()))?;
        let service = RedisService::new(config.redis_config(pool_size)).await?;

        Ok(Self::with_store(
            config,
            Arc::new(RedisStore::new(service)),
            registry,
        ))
    }

    /// Build the server on top of any store.
    pub fn with_store(
        config: Config,
        store: Arc<dyn QueueStore>,
        registry: HandlerRegistry,
    ) -> Self {
        let worker = Worker::with_config(Arc::clone(&store), registry, config.worker_config());
        let poller = Poller::new(Arc::clone(&store), config.poll_interval())
            .with_events(worker.event_sender());
        let sweeper = LeaseSweeper::new(Arc::clone(&store), config.sweep_interval());

        Self {
            config,
            store,
            worker,
            poller,
            sweeper,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared store.
    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    /// A producer sharing this server's store and event channel.
    pub fn client(&self) -> Client {
        Client::new(self.store()).with_events(self.worker.event_sender())
    }

    /// The worker pool.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Receive job state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.worker.subscribe()
    }

    /// Start the worker pool, poller and sweeper.
    pub async fn start(&mut self) -> QueueResult<()> {
        self.config.validate()?;
        self.store.ping().await?;

        self.worker.start()?;
        self.poller.start()?;
        self.sweeper.start()?;

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.ordered_queues(),
            namespace = %self.config.namespace,
            "Harbor server started"
        );
        Ok(())
    }

    /// Stop polling and sweeping, then drain the worker pool.
    pub async fn stop(&mut self) -> QueueResult<()> {
        self.poller.stop().await;
        self.sweeper.stop().await;
        self.worker.stop().await?;

        info!("Harbor server stopped");
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop.
    pub async fn run_until_shutdown<F>(mut self, shutdown: F) -> QueueResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown requested");
        self.stop().await
    }
}
