//! Queue-side half of a listing job.

use async_trait::async_trait;
use cache_store::CacheStore;
use queue_worker::{MessageHandler, QueueError};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::cache::JobCache;
use crate::config::ListingConfig;
use crate::domains::ListingDomain;
use crate::error::{JobError, JobResult};
use crate::models::{JobMeta, JobMetaPatch, JobStatus, ListingJobMessage};
use crate::source::ChunkSource;

/// Drains a listing job chunk by chunk into the job cache.
///
/// A retried message resumes after the items already stored. The job is
/// re-checked before every append, so deleting it stops processing without
/// resurrecting its data.
pub struct ListingProcessor<D: ListingDomain> {
    cache: JobCache<D::Item>,
    source: Arc<dyn ChunkSource<D>>,
}

impl<D: ListingDomain> ListingProcessor<D> {
    pub fn new(store: Arc<dyn CacheStore>, config: &ListingConfig, source: Arc<dyn ChunkSource<D>>) -> Self {
        Self {
            cache: JobCache::new(store, D::KEY_PREFIX, config.ttl),
            source,
        }
    }

    #[instrument(skip(self, message), fields(domain = D::NAME, job_id = %message.job_id))]
    async fn run(&self, message: &ListingJobMessage<D::Params>) -> JobResult<()> {
        message.params.validate()?;
        let job_id = message.job_id.as_str();

        let Some(meta) = self.cache.get_meta(job_id).await? else {
            info!("Job no longer exists, nothing to do");
            return Ok(());
        };
        if meta.user_id != message.user_id {
            return Err(JobError::Forbidden(job_id.to_string()));
        }
        if meta.status.is_terminal() {
            debug!(status = %meta.status, "Job already finished");
            return Ok(());
        }

        let meta = match self.patch(job_id, &JobMetaPatch::status(JobStatus::Processing)).await? {
            Some(meta) => meta,
            None => return Ok(()),
        };

        let chunk_size = message.chunk_size.max(1);
        let mut offset = self.cache.stored_len(job_id).await?;
        if offset != meta.processed {
            warn!(stored = offset, processed = meta.processed, "Stored items and progress disagree, resuming from stored items");
        }
        if offset > 0 {
            info!(offset, "Resuming job");
        }

        let mut total = meta.total;
        loop {
            let page = self
                .source
                .fetch_chunk(&message.user_id, &message.params, offset, chunk_size)
                .await?;
            let fetched = page.items.len() as u64;
            if let Some(reported) = page.total {
                total = Some(total.map_or(reported, |known| known.max(reported)));
            }

            if self.cache.get_meta(job_id).await?.is_none() {
                info!(offset, "Job deleted while processing, aborting");
                return Ok(());
            }

            if fetched > 0 {
                self.cache.append(job_id, &page.items).await?;
                offset += fetched;
            }

            let progress = JobMetaPatch {
                processed: Some(offset.max(meta.processed)),
                total,
                ..Default::default()
            };
            if self.patch(job_id, &progress).await?.is_none() {
                // A delete between the check and the append leaves a data
                // list with no meta behind it
                self.cache.delete(job_id).await?;
                return Ok(());
            }
            debug!(offset, fetched, ?total, "Stored chunk");

            if fetched < chunk_size || total.is_some_and(|t| offset >= t) {
                break;
            }
        }

        let final_total = total.map_or(offset, |t| t.max(offset));
        let done = JobMetaPatch::status(JobStatus::Completed).with_total(final_total);
        if self.patch(job_id, &done).await?.is_some() {
            info!(items = offset, total = final_total, "Job completed");
        }
        Ok(())
    }

    /// `update_meta` where a vanished job yields `None` instead of an error.
    async fn patch(&self, job_id: &str, patch: &JobMetaPatch) -> JobResult<Option<JobMeta>> {
        match self.cache.update_meta(job_id, patch).await {
            Ok(meta) => Ok(Some(meta)),
            Err(JobError::NotFound(_)) => {
                info!(job_id, "Job expired or deleted while processing, aborting");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<D: ListingDomain> MessageHandler for ListingProcessor<D> {
    type Payload = ListingJobMessage<D::Params>;

    fn name(&self) -> &'static str {
        D::NAME
    }

    fn dedup_key(&self, message: &Self::Payload) -> Option<String> {
        Some(format!("{}:{}", D::NAME, message.job_id))
    }

    async fn process(&self, message: &Self::Payload) -> Result<(), QueueError> {
        self.run(message).await.map_err(QueueError::from)
    }

    /// Pollers see `failed` with the reason instead of a stuck job. Only the
    /// owner's own message may fail it.
    async fn on_dead_letter(&self, message: &Self::Payload, reason: &str) {
        match self.cache.get_meta(&message.job_id).await {
            Ok(Some(meta)) if meta.user_id == message.user_id => {}
            Ok(Some(_)) => {
                warn!(job_id = %message.job_id, user_id = %message.user_id, "Dead-lettered message does not own the job, leaving it untouched");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "Failed to read job before marking it failed");
                return;
            }
        }

        match self.cache.update_meta(&message.job_id, &JobMetaPatch::failed(reason)).await {
            Ok(_) => warn!(job_id = %message.job_id, reason, "Marked job failed"),
            Err(JobError::NotFound(_)) => {}
            Err(e) => warn!(job_id = %message.job_id, error = %e, "Failed to mark job failed"),
        }
    }
}
