use cache_store::CacheStore;
use core_config::ConfigError;
use queue_worker::QueueClient;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::JobCache;
use crate::config::ListingConfig;
use crate::domains::{DeletePolicy, ListingDomain};
use crate::error::{JobError, JobResult};
use crate::models::{AuthUser, CreateJobRequest, JobMeta, JobPageResponse, JobStatus, ListingJobMessage, PageQuery};

/// Caller-facing job operations of one listing domain.
pub struct JobService<D: ListingDomain> {
    cache: JobCache<D::Item>,
    queue: QueueClient,
    config: ListingConfig,
    _domain: PhantomData<fn() -> D>,
}

impl<D: ListingDomain> Clone for JobService<D> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            _domain: PhantomData,
        }
    }
}

impl<D: ListingDomain> JobService<D> {
    pub fn new(store: Arc<dyn CacheStore>, queue: QueueClient, config: ListingConfig) -> Self {
        let cache = JobCache::new(store, D::KEY_PREFIX, config.ttl);
        Self {
            cache,
            queue,
            config,
            _domain: PhantomData,
        }
    }

    /// Build with the domain's configuration loaded from its env prefix.
    pub fn from_env(store: Arc<dyn CacheStore>, queue: QueueClient) -> Result<Self, ConfigError> {
        let config = ListingConfig::from_env_with_defaults(D::ENV_PREFIX, D::default_config())?;
        Ok(Self::new(store, queue, config))
    }

    pub fn config(&self) -> &ListingConfig {
        &self.config
    }

    pub fn cache(&self) -> &JobCache<D::Item> {
        &self.cache
    }

    /// Seed the job and publish its work message. Never waits for the worker.
    #[instrument(skip(self, user, request), fields(domain = D::NAME, user_id = %user.user_id))]
    pub async fn create_job(&self, user: &AuthUser, request: CreateJobRequest<D::Params>) -> JobResult<JobMeta> {
        request.params.validate()?;

        let chunk_size = self.config.normalize_chunk_size(request.chunk_size);
        let job_id = Uuid::now_v7().to_string();
        let meta = JobMeta::pending(&job_id, &user.user_id, chunk_size);

        self.cache.initialize_job(&meta).await?;

        let message = ListingJobMessage {
            job_id: job_id.clone(),
            user_id: user.user_id.clone(),
            chunk_size,
            params: request.params,
        };

        if let Err(e) = self.publish(&message).await {
            // Don't leave a pending job nobody will ever process
            if let Err(cleanup) = self.cache.delete(&job_id).await {
                warn!(job_id = %job_id, error = %cleanup, "Failed to remove unpublished job");
            }
            return Err(e);
        }

        info!(job_id = %job_id, chunk_size, "Created job");
        Ok(meta)
    }

    /// Status plus one page of items, starting at `query.cursor`.
    #[instrument(skip(self, query), fields(domain = D::NAME))]
    pub async fn get_job(&self, user_id: &str, job_id: &str, query: PageQuery) -> JobResult<JobPageResponse<D::Item>> {
        let meta = self.owned_meta(user_id, job_id).await?;

        let page_size = self.config.normalize_page_size(query.page_size);
        let cursor = query.cursor.unwrap_or(0);
        let page = self.cache.get_items(job_id, cursor, page_size).await?;

        let next = cursor + page.items.len() as u64;
        let done = meta.status == JobStatus::Completed && page.next_cursor.is_none();

        Ok(JobPageResponse {
            job_id: meta.job_id,
            status: meta.status,
            processed: meta.processed,
            total: meta.total,
            items: page.items,
            next_cursor: if done { None } else { Some(next) },
            done,
            error: meta.error,
        })
    }

    /// Remove the job. In-flight processing notices on its next append.
    #[instrument(skip(self), fields(domain = D::NAME))]
    pub async fn delete_job(&self, user_id: &str, job_id: &str) -> JobResult<()> {
        match self.owned_meta(user_id, job_id).await {
            Ok(_) => {}
            Err(JobError::NotFound(_)) if D::DELETE_POLICY == DeletePolicy::Idempotent => return Ok(()),
            Err(e) => return Err(e),
        }

        self.cache.delete(job_id).await?;
        info!(job_id = %job_id, "Deleted job");
        Ok(())
    }

    async fn owned_meta(&self, user_id: &str, job_id: &str) -> JobResult<JobMeta> {
        let meta = self
            .cache
            .get_meta(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if meta.user_id != user_id {
            return Err(JobError::Forbidden(job_id.to_string()));
        }
        Ok(meta)
    }

    async fn publish(&self, message: &ListingJobMessage<D::Params>) -> JobResult<()> {
        self.queue.assert_queue_with_dlq(D::QUEUE_NAME, D::DLQ_NAME).await?;
        self.queue.publish_json(D::QUEUE_NAME, message).await?;
        Ok(())
    }
}
