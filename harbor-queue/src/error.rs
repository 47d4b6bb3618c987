//! Error types for queue operations.

use crate::codec::CodecError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a [`QueueStore`](crate::store::QueueStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached; the call may succeed later.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the operation.
    #[error("Store command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Check if the error is transient.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<harbor_redis::RedisError> for StoreError {
    fn from(err: harbor_redis::RedisError) -> Self {
        if err.is_retryable() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        harbor_redis::RedisError::from(err).into()
    }
}

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Transient store fault
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store rejected the operation
    #[error("Store error: {0}")]
    Store(String),

    /// Envelope could not be encoded or decoded
    #[error("Codec error: {0}")]
    Decode(#[from] CodecError),

    /// Handler returned an error
    #[error("Job execution failed: {0}")]
    HandlerFailure(String),

    /// No handler registered for job type
    #[error("No handler registered for job type: {0}")]
    NoHandler(String),

    /// The claim on a job lapsed before its outcome was recorded
    #[error("Lease expired for job {0}")]
    LeaseExpired(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("Queue error: {0}")]
    Other(String),
}

impl QueueError {
    /// Build a handler failure from any displayable error.
    ///
    /// ```
    /// use harbor_queue::QueueError;
    ///
    /// let err = "12".parse::<u8>().and_then(|_| "x".parse::<u8>()).map_err(QueueError::handler);
    /// assert!(matches!(err, Err(QueueError::HandlerFailure(_))));
    /// ```
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::HandlerFailure(err.to_string())
    }

    /// Check if the error is a transient store fault.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Command(msg) => Self::Store(msg),
        }
    }
}

impl From<harbor_redis::RedisError> for QueueError {
    fn from(err: harbor_redis::RedisError) -> Self {
        match err {
            harbor_redis::RedisError::Config(msg) => Self::Config(msg),
            other => StoreError::from(other).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let err: QueueError = StoreError::Unavailable("refused".into()).into();
        assert!(err.is_store_unavailable());

        let err: QueueError = StoreError::Command("NOSCRIPT".into()).into();
        assert!(matches!(err, QueueError::Store(_)));
    }

    #[test]
    fn test_redis_error_mapping() {
        let err: StoreError = harbor_redis::RedisError::Timeout.into();
        assert!(err.is_unavailable());

        let err: QueueError = harbor_redis::RedisError::Config("bad url".into()).into();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::NoHandler("echo".to_string());
        assert!(err.to_string().contains("echo"));
    }
}
