//! Queue error types and error categorization
//!
//! The category decides what the consumer does with a failed message:
//! - **Transient**: spend one unit of retry budget and try again
//! - **Permanent**: dead-letter immediately

use cache_store::CacheError;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure (store unavailable, upstream timeout)
    Transient,
    /// Unrecoverable error, retrying cannot help
    Permanent,
}

/// Queue and message processing errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Cache store error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message processing failed
    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    /// Broker rejected an operation
    #[error("Broker error: {0}")]
    Broker(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        QueueError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        QueueError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(_) => ErrorCategory::Transient,
            QueueError::Cache(_) => ErrorCategory::Transient,
            QueueError::Serialization(_) => ErrorCategory::Permanent,
            QueueError::Processing { category, .. } => *category,
            QueueError::Broker(_) => ErrorCategory::Transient,
            QueueError::Config(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category() == ErrorCategory::Permanent
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
