//! Job cache: a meta blob and an append-only item list per job.
//!
//! Keys are `{prefix}:job:{job_id}:meta` and `{prefix}:job:{job_id}:data`.
//! Every touch refreshes the TTL of both keys so the halves expire together.

use cache_store::CacheStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{JobError, JobResult};
use crate::models::{ItemsPage, JobMeta, JobMetaPatch};

pub struct JobCache<T> {
    store: Arc<dyn CacheStore>,
    prefix: String,
    ttl: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for JobCache<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            _item: PhantomData,
        }
    }
}

impl<T> JobCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            _item: PhantomData,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn meta_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:meta", self.prefix, job_id)
    }

    pub fn data_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:data", self.prefix, job_id)
    }

    /// Clear anything stored under the id, then write fresh meta.
    ///
    /// The data list is created (and gets its TTL) on the first append.
    #[instrument(skip(self, meta), fields(job_id = %meta.job_id))]
    pub async fn initialize_job(&self, meta: &JobMeta) -> JobResult<()> {
        self.delete(&meta.job_id).await?;
        self.write_meta(meta).await?;
        debug!("Initialized job");
        Ok(())
    }

    /// `None` when the job is absent or expired.
    pub async fn get_meta(&self, job_id: &str) -> JobResult<Option<JobMeta>> {
        match self.store.get(&self.meta_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Merge `patch` into the stored meta. Fails with `NotFound` when the
    /// job expired or was deleted.
    pub async fn update_meta(&self, job_id: &str, patch: &JobMetaPatch) -> JobResult<JobMeta> {
        let current = self
            .get_meta(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let updated = patch.apply(&current)?;
        self.write_meta(&updated).await?;
        self.store.expire(&self.data_key(job_id), self.ttl).await?;
        Ok(updated)
    }

    /// Append items in call order and return the new list length. An empty
    /// call still refreshes both TTLs.
    pub async fn append(&self, job_id: &str, items: &[T]) -> JobResult<u64> {
        let values = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let length = self.store.list_push(&self.data_key(job_id), &values).await?;
        self.touch(job_id).await?;
        Ok(length)
    }

    /// Number of items stored so far.
    pub async fn stored_len(&self, job_id: &str) -> JobResult<u64> {
        Ok(self.store.list_len(&self.data_key(job_id)).await?)
    }

    /// Read the window `[cursor, cursor + limit)`.
    pub async fn get_items(&self, job_id: &str, cursor: u64, limit: u64) -> JobResult<ItemsPage<T>> {
        let data_key = self.data_key(job_id);
        let raw = self.store.list_range(&data_key, cursor, limit).await?;
        let total = self.store.list_len(&data_key).await?;
        self.touch(job_id).await?;

        let items = raw
            .iter()
            .map(|value| serde_json::from_str(value))
            .collect::<Result<Vec<T>, _>>()?;

        let end = cursor + items.len() as u64;
        let next_cursor = if end >= total { None } else { Some(end) };

        Ok(ItemsPage {
            items,
            next_cursor,
            total,
        })
    }

    /// Remove meta and data. No-op when absent.
    pub async fn delete(&self, job_id: &str) -> JobResult<()> {
        self.store
            .del(&[self.meta_key(job_id), self.data_key(job_id)])
            .await?;
        Ok(())
    }

    async fn write_meta(&self, meta: &JobMeta) -> JobResult<()> {
        let raw = serde_json::to_string(meta)?;
        self.store.set_ex(&self.meta_key(&meta.job_id), &raw, self.ttl).await?;
        Ok(())
    }

    async fn touch(&self, job_id: &str) -> JobResult<()> {
        self.store.expire(&self.meta_key(job_id), self.ttl).await?;
        self.store.expire(&self.data_key(job_id), self.ttl).await?;
        Ok(())
    }
}
