//! Short-TTL cache for idempotent GET-style computations.
//!
//! A request handler can publish a computation to a worker and then
//! [`QueryCache::wait_for_cache`] for the worker to populate the entry,
//! turning an asynchronous pipeline into a bounded-latency response.

use core_config::{ConfigError, FromEnv, env_parse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::store::CacheStore;

const DEFAULT_PREFIX: &str = "query";

#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    pub ttl: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

impl FromEnv for QueryCacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let secs: u64 = env_parse("QUERY_CACHE_TTL_SECONDS", 30)?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key: "QUERY_CACHE_TTL_SECONDS".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            ttl: Duration::from_secs(secs),
        })
    }
}

/// Query result cache keyed by `(endpoint, params)`.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: Duration,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, config: QueryCacheConfig) -> Self {
        Self {
            store,
            prefix: DEFAULT_PREFIX.to_string(),
            default_ttl: config.ttl,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Deterministic key: `{prefix}:{endpoint}:{sha256(params)}`.
    ///
    /// Params are normalized through `serde_json::Value`, whose maps are
    /// ordered, so field order in the caller's struct does not matter.
    pub fn key<P: Serialize + ?Sized>(&self, endpoint: &str, params: &P) -> CacheResult<String> {
        let canonical = serde_json::to_string(&serde_json::to_value(params)?)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(format!("{}:{}:{}", self.prefix, endpoint, const_hex::encode(digest)))
    }

    /// Read a cached value. Store and decode failures are logged and
    /// reported as a miss.
    pub async fn get<T, P>(&self, endpoint: &str, params: &P) -> Option<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let key = match self.key(endpoint, params) {
            Ok(key) => key,
            Err(e) => {
                warn!(endpoint, error = %e, "Failed to build query cache key");
                return None;
            }
        };

        match self.store.get(&key).await {
            Ok(Some(raw)) => decode(&key, &raw),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Query cache read failed");
                None
            }
        }
    }

    /// Write a value with the default TTL.
    pub async fn set<T, P>(&self, endpoint: &str, params: &P, value: &T) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        self.set_with_ttl(endpoint, params, value, self.default_ttl).await
    }

    pub async fn set_with_ttl<T, P>(&self, endpoint: &str, params: &P, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        let key = self.key(endpoint, params)?;
        let raw = serde_json::to_string(value)?;
        self.store.set_ex(&key, &raw, ttl).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached query result");
        Ok(())
    }

    /// Delete every entry matching `{prefix}:{pattern}`. Returns the number
    /// of keys removed.
    pub async fn invalidate(&self, pattern: &str) -> CacheResult<u64> {
        let keys = self.store.scan_keys(&format!("{}:{}", self.prefix, pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.del(&keys).await?;
        debug!(pattern, removed, "Invalidated query cache entries");
        Ok(removed)
    }

    /// Drop every cached result of one endpoint.
    pub async fn invalidate_endpoint(&self, endpoint: &str) -> CacheResult<u64> {
        self.invalidate(&format!("{}:*", endpoint)).await
    }

    /// Poll until the entry appears or `timeout` elapses.
    ///
    /// `None` means "not ready yet", not failure. At least one read is made
    /// even with a zero timeout.
    pub async fn wait_for_cache<T, P>(
        &self,
        endpoint: &str,
        params: &P,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let deadline = Instant::now() + timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        loop {
            if let Some(value) = self.get(endpoint, params).await {
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(endpoint, timeout_ms = timeout.as_millis() as u64, "Query cache wait timed out");
                return None;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Read several entries of one endpoint. Positionally aligned with
    /// `params`; soft like [`get`](Self::get).
    pub async fn get_batch<T, P>(&self, endpoint: &str, params: &[P]) -> Vec<Option<T>>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let keys: Option<Vec<String>> = params.iter().map(|p| self.key(endpoint, p).ok()).collect();
        let Some(keys) = keys else {
            warn!(endpoint, "Failed to build query cache keys for batch");
            return params.iter().map(|_| None).collect();
        };

        match self.store.get_many(&keys).await {
            Ok(values) => keys
                .iter()
                .zip(values)
                .map(|(key, raw)| raw.and_then(|raw| decode(key, &raw)))
                .collect(),
            Err(e) => {
                warn!(endpoint, error = %e, "Query cache batch read failed");
                params.iter().map(|_| None).collect()
            }
        }
    }

    /// Write several entries of one endpoint with the default TTL.
    pub async fn set_batch<T, P>(&self, endpoint: &str, entries: &[(P, T)]) -> CacheResult<()>
    where
        T: Serialize,
        P: Serialize,
    {
        let mut encoded = Vec::with_capacity(entries.len());
        for (params, value) in entries {
            encoded.push((self.key(endpoint, params)?, serde_json::to_string(value)?));
        }
        self.store.set_many_ex(&encoded, self.default_ttl).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, error = %e, "Discarding undecodable query cache entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::memory::InMemoryCacheStore;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Summary {
        count: u32,
    }

    fn cache() -> (InMemoryCacheStore, QueryCache) {
        let store = InMemoryCacheStore::new();
        let cache = QueryCache::new(Arc::new(store.clone()), QueryCacheConfig::default());
        (store, cache)
    }

    #[test]
    fn test_key_ignores_field_order() {
        let (_, cache) = cache();
        let a = cache.key("companies", &json!({"page": 1, "q": "acme"})).unwrap();
        let b = cache.key("companies", &json!({"q": "acme", "page": 1})).unwrap();
        let c = cache.key("companies", &json!({"q": "acme", "page": 2})).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("query:companies:"));
        assert_eq!(a.len(), "query:companies:".len() + 64);
    }

    #[test]
    fn test_key_is_lowercase_sha256_hex() {
        let (_, cache) = cache();
        let key = cache.key("companies", &json!({})).unwrap();
        assert_eq!(
            key,
            "query:companies:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[tokio::test]
    async fn test_get_set() {
        let (_, cache) = cache();
        let params = json!({"userId": "u1"});

        assert_eq!(cache.get::<Summary, _>("stats", &params).await, None);
        cache.set("stats", &params, &Summary { count: 7 }).await.unwrap();
        assert_eq!(cache.get("stats", &params).await, Some(Summary { count: 7 }));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let (store, cache) = cache();
        let params = json!({"x": 1});
        let key = cache.key("stats", &params).unwrap();
        store.set_ex(&key, "not json", Duration::from_secs(5)).await.unwrap();

        assert_eq!(cache.get::<Summary, _>("stats", &params).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_endpoint() {
        let (store, cache) = cache();
        for page in 0..3 {
            cache.set("companies", &json!({"page": page}), &Summary { count: page }).await.unwrap();
        }
        cache.set("invites", &json!({"page": 0}), &Summary { count: 0 }).await.unwrap();

        assert_eq!(cache.invalidate_endpoint("companies").await.unwrap(), 3);
        assert_eq!(store.len(), 1);
        assert_eq!(cache.invalidate("nothing:*").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cache_sees_late_population() {
        let (_, cache) = cache();
        let params = json!({"q": "acme"});

        let writer = cache.clone();
        let writer_params = params.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.set("search", &writer_params, &Summary { count: 1 }).await.unwrap();
        });

        let found: Option<Summary> = cache
            .wait_for_cache("search", &params, Duration::from_secs(2), Duration::from_millis(100))
            .await;
        assert_eq!(found, Some(Summary { count: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cache_times_out() {
        let (_, cache) = cache();
        let started = Instant::now();

        let found: Option<Summary> = cache
            .wait_for_cache("search", &json!({}), Duration::from_millis(500), Duration::from_millis(200))
            .await;

        assert_eq!(found, None);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500) && waited < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_batch() {
        let (_, cache) = cache();
        let entries = vec![
            (json!({"id": 1}), Summary { count: 1 }),
            (json!({"id": 2}), Summary { count: 2 }),
        ];
        cache.set_batch("item", &entries).await.unwrap();

        let got: Vec<Option<Summary>> = cache
            .get_batch("item", &[json!({"id": 2}), json!({"id": 3}), json!({"id": 1})])
            .await;
        assert_eq!(got, vec![Some(Summary { count: 2 }), None, Some(Summary { count: 1 })]);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn get_many(&self, _: &[String]) -> CacheResult<Vec<Option<String>>> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> CacheResult<()> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn get_del(&self, _: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn exists(&self, _: &str) -> CacheResult<bool> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn del(&self, _: &[String]) -> CacheResult<u64> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> CacheResult<bool> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn list_push(&self, _: &str, _: &[String]) -> CacheResult<u64> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn list_range(&self, _: &str, _: u64, _: u64) -> CacheResult<Vec<String>> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn list_len(&self, _: &str) -> CacheResult<u64> {
            Err(CacheError::Serialization("down".into()))
        }
        async fn scan_keys(&self, _: &str) -> CacheResult<Vec<String>> {
            Err(CacheError::Serialization("down".into()))
        }
    }

    #[tokio::test]
    async fn test_reads_are_soft_writes_propagate() {
        let cache = QueryCache::new(Arc::new(BrokenStore), QueryCacheConfig::default());
        let params = json!({"a": 1});

        assert_eq!(cache.get::<Summary, _>("x", &params).await, None);
        let batch: Vec<Option<Summary>> = cache.get_batch("x", &[params.clone()]).await;
        assert_eq!(batch, vec![None]);
        assert!(cache.set("x", &params, &Summary { count: 1 }).await.is_err());
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_var("QUERY_CACHE_TTL_SECONDS", Some("45"), || {
            assert_eq!(QueryCacheConfig::from_env().unwrap().ttl, Duration::from_secs(45));
        });
        temp_env::with_var("QUERY_CACHE_TTL_SECONDS", Some("0"), || {
            assert!(QueryCacheConfig::from_env().is_err());
        });
        temp_env::with_var_unset("QUERY_CACHE_TTL_SECONDS", || {
            assert_eq!(QueryCacheConfig::from_env().unwrap().ttl, Duration::from_secs(30));
        });
    }
}
