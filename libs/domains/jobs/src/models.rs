use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::error::{JobError, JobResult};

/// Job lifecycle: `pending -> processing -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Staying put is allowed; moving backward or between terminal states is not.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self == next || next.rank() > self.rank()
    }
}

/// Authenticated caller, supplied by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AuthUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
        }
    }
}

/// Job metadata stored under the meta key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub processed: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub chunk_size: u64,
    #[serde(alias = "startedAt")]
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobMeta {
    pub fn pending(job_id: impl Into<String>, user_id: impl Into<String>, chunk_size: u64) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            processed: 0,
            total: None,
            error: None,
            chunk_size,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of [`JobMeta`]. Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetaPatch {
    pub status: Option<JobStatus>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub error: Option<String>,
}

impl JobMetaPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(processed: u64, total: Option<u64>) -> Self {
        Self {
            processed: Some(processed),
            total,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_processed(mut self, processed: u64) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Shallow-merge into `meta`, rejecting any backward move.
    pub fn apply(&self, meta: &JobMeta) -> JobResult<JobMeta> {
        let mut next = meta.clone();

        if let Some(status) = self.status {
            if !meta.status.can_transition_to(status) {
                return Err(JobError::InvalidTransition(format!(
                    "job {} cannot move from {} to {}",
                    meta.job_id, meta.status, status
                )));
            }
            next.status = status;
        }

        if let Some(processed) = self.processed {
            if processed < meta.processed {
                return Err(JobError::InvalidTransition(format!(
                    "job {} processed count cannot shrink from {} to {}",
                    meta.job_id, meta.processed, processed
                )));
            }
            next.processed = processed;
        }

        if let Some(total) = self.total {
            if meta.total.is_some_and(|current| total < current) {
                return Err(JobError::InvalidTransition(format!(
                    "job {} total cannot shrink to {}",
                    meta.job_id, total
                )));
            }
            next.total = Some(total);
        }

        if let Some(error) = &self.error {
            if next.status != JobStatus::Failed {
                return Err(JobError::InvalidTransition(format!(
                    "job {} can only carry an error when failed",
                    meta.job_id
                )));
            }
            next.error = Some(error.clone());
        }

        next.updated_at = Utc::now();
        Ok(next)
    }
}

/// Window of stored items read from the data list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsPage<T> {
    pub items: Vec<T>,
    /// `None` once the window reaches the end of the stored list
    pub next_cursor: Option<u64>,
    /// Current stored list length
    pub total: u64,
}

/// Paging parameters of a status/read request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub cursor: Option<u64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

impl PageQuery {
    pub fn new(cursor: u64, page_size: i64) -> Self {
        Self {
            cursor: Some(cursor),
            page_size: Some(page_size),
        }
    }
}

/// Job creation request: domain parameters plus an optional chunk size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest<P> {
    #[serde(flatten)]
    pub params: P,
    #[serde(default)]
    pub chunk_size: Option<i64>,
}

impl<P> CreateJobRequest<P> {
    pub fn new(params: P) -> Self {
        Self {
            params,
            chunk_size: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: i64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Work message published to a domain queue:
/// `{jobId, userId, chunkSize, <domain params>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingJobMessage<P> {
    pub job_id: String,
    pub user_id: String,
    pub chunk_size: u64,
    #[serde(flatten)]
    pub params: P,
}

/// Status/read response returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPageResponse<T> {
    pub job_id: String,
    pub status: JobStatus,
    pub processed: u64,
    pub total: Option<u64>,
    pub items: Vec<T>,
    pub next_cursor: Option<u64>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
