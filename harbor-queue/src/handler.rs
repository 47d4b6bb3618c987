//! Handler trait and the registry that maps job types to handlers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::QueueResult;
use crate::job::JobArgs;

/// Code that runs a job.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use harbor_queue::{Handler, JobArgs, QueueResult};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Handler for Echo {
///     async fn perform(&self, args: JobArgs) -> QueueResult<()> {
///         println!("{:?}", args);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run the job with its arguments.
    async fn perform(&self, args: JobArgs) -> QueueResult<()>;
}

/// Adapts an async closure to [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    async fn perform(&self, args: JobArgs) -> QueueResult<()> {
        (self.f)(args).await
    }
}

/// Mapping from job type name to handler.
///
/// Filled before the worker starts; the worker shares it read-only.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same name.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Register an async closure.
    ///
    /// ```
    /// use harbor_queue::HandlerRegistry;
    ///
    /// let mut registry = HandlerRegistry::new();
    /// registry.register_fn("echo", |args| async move {
    ///     println!("{:?}", args);
    ///     Ok(())
    /// });
    /// assert!(registry.contains("echo"));
    /// ```
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        self.register(job_type, FnHandler::new(f))
    }

    /// Look up a handler.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a job type is registered.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for Counter {
        async fn perform(&self, args: JobArgs) -> QueueResult<()> {
            self.0.fetch_add(args.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("count", Counter(Arc::clone(&calls)));

        let handler = registry.get("count").unwrap();
        handler.perform(vec![json!(1), json!(2)]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("ok", |_args| async { Ok(()) })
            .register_fn("fail", |_args| async {
                Err(QueueError::HandlerFailure("nope".into()))
            });

        assert_eq!(registry.job_types(), vec!["fail", "ok"]);
        assert!(registry.get("ok").unwrap().perform(vec![]).await.is_ok());
        assert!(registry.get("fail").unwrap().perform(vec![]).await.is_err());
    }

    #[test]
    fn test_replace_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |_args| async { Ok(()) });
        registry.register_fn("echo", |_args| async { Ok(()) });

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
