//! Shared test utilities for the job and notification crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic ids and names (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Redis Testing
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests (they need Docker, so keep them `#[ignore]`d):
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let data = TestDataBuilder::from_test_name("my_redis_test");
//!     let store = RedisCacheStore::new(connect(redis.connection_string()).await.unwrap());
//!     store.set_ex(&format!("delivery:pending:{}", data.message_id(1)), "{}", ttl).await.unwrap();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic values
///
/// The same seed always yields the same ids, so failures reproduce.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name (recommended)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let data = TestDataBuilder::from_test_name("test_job_pagination");
    /// assert_eq!(data.user_id(), TestDataBuilder::from_test_name("test_job_pagination").user_id());
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    fn uuid(&self, n: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..].copy_from_slice(&n.to_le_bytes());
        Uuid::from_bytes(bytes)
    }

    /// Owner id for jobs and notifications
    pub fn user_id(&self) -> String {
        format!("user-{}", self.uuid(0).simple())
    }

    /// The `n`-th job id of this test
    pub fn job_id(&self, n: u64) -> String {
        self.uuid(n + 1).to_string()
    }

    /// The `n`-th notification message id of this test
    pub fn message_id(&self, n: u64) -> String {
        format!("msg-{}", self.uuid(u64::MAX - n).simple())
    }

    /// Queue name unique to this test, e.g. `test.company-list.1234`
    ///
    /// Lets tests share one Redis without seeing each other's streams.
    pub fn queue(&self, name: &str) -> String {
        format!("test.{}.{}", name, self.seed)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert `items` is `0..items.len()` mapped through `expected`, in order
    pub fn assert_in_order<T, F>(items: &[T], expected: F, context: &str)
    where
        T: PartialEq + std::fmt::Debug,
        F: Fn(usize) -> T,
    {
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item, &expected(i), "{}: item {} out of order", context, i);
        }
    }
}
