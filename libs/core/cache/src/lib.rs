//! Cache layer shared by the job, delivery-confirmation and query caches.
//!
//! Every consumer is written against [`CacheStore`]; production binds it to
//! Redis through [`RedisCacheStore`], tests to [`InMemoryCacheStore`].
//! Subsystems share one keyspace and are separated only by key prefix.

pub mod connector;
pub mod error;
pub mod memory;
pub mod query;
pub mod redis_store;
pub mod retry;
pub mod store;

pub use connector::{check_health, connect, connect_from_config_with_retry};
pub use error::{CacheError, CacheResult};
pub use memory::InMemoryCacheStore;
pub use query::{QueryCache, QueryCacheConfig};
pub use redis_store::RedisCacheStore;
pub use retry::RetryConfig;
pub use store::CacheStore;

// Re-export for downstream crates that hold a connection directly
pub use redis::aio::ConnectionManager;
