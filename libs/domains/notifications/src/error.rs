//! Error types for the notifications domain.

use cache_store::CacheError;
use queue_worker::QueueError;
use thiserror::Error;

/// Result type for notification operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid notification: {0}")]
    Validation(String),

    /// Storing the notification failed.
    #[error("Persistence error: {message}")]
    Persistence { message: String, transient: bool },

    /// Pushing to the realtime channel failed.
    #[error("Realtime publish error: {0}")]
    Publish(String),

    /// The client did not confirm within the wait window.
    #[error("Delivery of {0} was not confirmed")]
    Unconfirmed(String),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for DeliveryError {
    fn from(err: validator::ValidationErrors) -> Self {
        DeliveryError::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Persistence {
            message: err.to_string(),
            transient: !err.is_decode(),
        }
    }
}

impl From<DeliveryError> for QueueError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Queue(inner) => inner,
            DeliveryError::Cache(inner) => QueueError::Cache(inner),
            DeliveryError::Redis(inner) => QueueError::Redis(inner),
            DeliveryError::Serialization(_) | DeliveryError::Validation(_) => QueueError::permanent(err.to_string()),
            DeliveryError::Persistence { transient: false, .. } => QueueError::permanent(err.to_string()),
            other => QueueError::transient(other.to_string()),
        }
    }
}
