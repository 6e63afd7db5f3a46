//! The key/value + list surface every cache consumer is written against.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheResult;

/// Cache store operations.
///
/// Keys are plain strings; callers namespace them by prefix (`jobs:`,
/// `delivery:`, `query:`, `dedup:`). Every TTL is rounded up to whole
/// seconds, matching Redis `EX` granularity.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a string value. `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Read several string values at once, positionally aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Write a string value with a TTL, replacing whatever was there.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Write several string values sharing one TTL.
    async fn set_many_ex(&self, entries: &[(String, String)], ttl: Duration) -> CacheResult<()> {
        for (key, value) in entries {
            self.set_ex(key, value, ttl).await?;
        }
        Ok(())
    }

    /// Atomically read and delete a string value.
    async fn get_del(&self, key: &str) -> CacheResult<Option<String>>;

    /// Whether the key currently exists.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    /// Reset the TTL of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Append values to the tail of a list, returning the new length.
    async fn list_push(&self, key: &str, values: &[String]) -> CacheResult<u64>;

    /// Read up to `limit` list elements starting at `offset`.
    async fn list_range(&self, key: &str, offset: u64, limit: u64) -> CacheResult<Vec<String>>;

    /// Length of a list (0 if absent).
    async fn list_len(&self, key: &str) -> CacheResult<u64>;

    /// All keys matching a glob pattern (`*`, `?`). O(n) over the keyspace.
    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>>;
}

/// Whole seconds for a TTL, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(30)), 30);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
