//! Jobs Domain
//!
//! Asynchronous listing jobs: a caller creates a job, a worker fills it
//! chunk by chunk, and the caller polls status and pages of results.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐              ┌───────────────────┐
//! │ JobService  │ ── publish ─►│ ListingProcessor  │ ← ChunkSource
//! └──────┬──────┘              └─────────┬─────────┘
//!        │ read / delete                 │ append / progress
//! ┌──────▼───────────────────────────────▼─────────┐
//! │            JobCache (meta + data list)          │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything is generic over a [`ListingDomain`]: company, invite,
//! friendship and notification listings, user search and bulk invite
//! actions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_jobs::{AuthUser, CompanyList, CompanyListParams, CreateJobRequest, JobService, PageQuery};
//!
//! let service = JobService::<CompanyList>::from_env(store, queue)?;
//! let job = service
//!     .create_job(&AuthUser::new(user_id), CreateJobRequest::new(CompanyListParams::default()))
//!     .await?;
//! let page = service.get_job(user_id, &job.job_id, PageQuery::default()).await?;
//! ```

pub mod cache;
pub mod config;
pub mod domains;
pub mod error;
pub mod models;
pub mod processor;
pub mod service;
pub mod source;

pub use cache::JobCache;
pub use config::ListingConfig;
pub use domains::{
    BulkInviteAction, CompanyList, CompanyListParams, CompanySummary, DeletePolicy, FriendSummary, FriendshipList,
    FriendshipListParams, FriendshipStatus, InviteActionOutcome, InviteBulk, InviteBulkParams, InviteList,
    InviteListParams, InviteStatus, InviteSummary, ListingDomain, NotificationList, NotificationListParams,
    NotificationSummary, UserSearch, UserSearchParams, UserSummary,
};
pub use error::{JobError, JobResult};
pub use models::{
    AuthUser, CreateJobRequest, ItemsPage, JobMeta, JobMetaPatch, JobPageResponse, JobStatus, ListingJobMessage,
    PageQuery,
};
pub use processor::ListingProcessor;
pub use service::JobService;
pub use source::{ChunkPage, ChunkSource, HttpChunkSource, HttpSourceConfig};
