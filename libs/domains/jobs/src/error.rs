use cache_store::CacheError;
use http::StatusCode;
use queue_worker::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Access to job {0} denied")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failure of the data source behind a listing.
    #[error("Upstream error: {message}")]
    Upstream { message: String, transient: bool },
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn upstream_transient(message: impl Into<String>) -> Self {
        JobError::Upstream {
            message: message.into(),
            transient: true,
        }
    }

    pub fn upstream_permanent(message: impl Into<String>) -> Self {
        JobError::Upstream {
            message: message.into(),
            transient: false,
        }
    }

    /// HTTP status the API layer responds with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::Forbidden(_) => StatusCode::FORBIDDEN,
            JobError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for JobError {
    fn from(err: validator::ValidationErrors) -> Self {
        JobError::Validation(err.to_string())
    }
}

/// Worker-side view: decides between retry and dead-letter.
impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Queue(inner) => inner,
            JobError::Cache(inner) => QueueError::Cache(inner),
            JobError::Upstream {
                message,
                transient: true,
            } => QueueError::transient(message),
            other => QueueError::permanent(other.to_string()),
        }
    }
}
