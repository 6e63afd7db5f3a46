//! Consumer and broker configuration
//!
//! Both load from the environment through [`FromEnv`]; the queue names come
//! from a [`QueueDef`] and are applied on top.

use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::registry::QueueDef;

/// How a transiently failed message is put back on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RetryMode {
    /// Publish a copy with `x-retry-count + 1`, then ack the original.
    /// The retry budget is enforced.
    #[default]
    Republish,
    /// `nack(requeue = true)`. The broker redelivers the message unchanged,
    /// so the retry counter never moves and the message retries until it
    /// succeeds or fails permanently.
    Requeue,
}

/// Configuration for a resilient consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume
    pub queue_name: String,

    /// Dead letter queue for malformed and exhausted messages
    pub dlq_name: String,

    /// Maximum unacknowledged messages held at once
    pub prefetch: usize,

    /// Failed attempts allowed before dead-lettering
    pub retry_max: u32,

    pub retry_mode: RetryMode,

    /// TTL of the "already processed" marker
    pub dedup_ttl: Duration,

    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(queue_name: impl Into<String>, dlq_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            dlq_name: dlq_name.into(),
            prefetch: 10,
            retry_max: 3,
            retry_mode: RetryMode::Republish,
            dedup_ttl: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Create a config for a [`QueueDef`] with default tuning
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self::new(Q::QUEUE_NAME, Q::DLQ_NAME)
    }

    /// Load tuning from the environment and apply it to a [`QueueDef`]
    pub fn from_env_for<Q: QueueDef>() -> Result<Self, ConfigError> {
        let tuning = Self::from_env()?;
        Ok(Self {
            queue_name: Q::QUEUE_NAME.to_string(),
            dlq_name: Q::DLQ_NAME.to_string(),
            ..tuning
        })
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn with_retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(invalid("queue_name", "must not be empty"));
        }
        if self.dlq_name.is_empty() || self.dlq_name == self.queue_name {
            return Err(invalid("dlq_name", "must be set and differ from the queue name"));
        }
        if self.prefetch == 0 {
            return Err(invalid("QUEUE_PREFETCH", "must be at least 1"));
        }
        if self.dedup_ttl.is_zero() {
            return Err(invalid("QUEUE_DEDUP_TTL_SECONDS", "must be greater than zero"));
        }
        Ok(())
    }
}

impl FromEnv for ConsumerConfig {
    /// Tuning only; queue names are left empty for the caller to fill.
    fn from_env() -> Result<Self, ConfigError> {
        let retry_mode_raw = env_or_default("QUEUE_RETRY_MODE", "republish");
        let retry_mode = retry_mode_raw
            .trim()
            .parse::<RetryMode>()
            .map_err(|e| ConfigError::ParseError {
                key: "QUEUE_RETRY_MODE".to_string(),
                details: format!("{e}: '{retry_mode_raw}'"),
            })?;

        Ok(Self {
            queue_name: String::new(),
            dlq_name: String::new(),
            prefetch: env_parse("QUEUE_PREFETCH", 10)?,
            retry_max: env_parse("QUEUE_RETRY_MAX", 3)?,
            retry_mode,
            dedup_ttl: Duration::from_secs(env_parse("QUEUE_DEDUP_TTL_SECONDS", 3600)?),
            poll_interval: Duration::from_millis(env_parse("QUEUE_POLL_INTERVAL_MS", 200)?),
        })
    }
}

/// Settings of the Redis Streams broker binding
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Consumer group shared by every worker replica
    pub consumer_group: String,

    /// Unique consumer ID within the group
    pub consumer_id: String,

    /// Entries pending longer than this are reclaimed from dead consumers
    pub claim_idle: Duration,

    /// Approximate stream cap (`MAXLEN ~`)
    pub max_length: u64,
}

impl BrokerConfig {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            claim_idle: Duration::from_secs(60),
            max_length: 100_000,
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("jobs-workers")
    }
}

impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(env_or_default("QUEUE_CONSUMER_GROUP", "jobs-workers"))
            .with_claim_idle(Duration::from_millis(env_parse("QUEUE_CLAIM_IDLE_MS", 60_000)?))
            .with_max_length(env_parse("QUEUE_MAX_LENGTH", 100_000)?))
    }
}

fn invalid(key: &str, details: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestQueue;

    impl QueueDef for TestQueue {
        const QUEUE_NAME: &'static str = "test.queue";
        const DLQ_NAME: &'static str = "test.queue.dlq";
    }

    #[test]
    fn test_from_queue_def() {
        let config = ConsumerConfig::from_queue_def::<TestQueue>();

        assert_eq!(config.queue_name, "test.queue");
        assert_eq!(config.dlq_name, "test.queue.dlq");
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.retry_max, 3);
        assert_eq!(config.retry_mode, RetryMode::Republish);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConsumerConfig::new("q", "q.dlq")
            .with_prefetch(0)
            .with_retry_max(5)
            .with_retry_mode(RetryMode::Requeue)
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(config.prefetch, 1);
        assert_eq!(config.retry_max, 5);
        assert_eq!(config.retry_mode, RetryMode::Requeue);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_validate_rejects_dlq_equal_to_queue() {
        assert!(ConsumerConfig::new("q", "q").validate().is_err());
        assert!(ConsumerConfig::new("q", "").validate().is_err());
    }

    #[test]
    fn test_from_env_for() {
        temp_env::with_vars(
            [
                ("QUEUE_PREFETCH", Some("4")),
                ("QUEUE_RETRY_MAX", Some("7")),
                ("QUEUE_RETRY_MODE", Some("Requeue")),
                ("QUEUE_DEDUP_TTL_SECONDS", None),
                ("QUEUE_POLL_INTERVAL_MS", None),
            ],
            || {
                let config = ConsumerConfig::from_env_for::<TestQueue>().unwrap();
                assert_eq!(config.queue_name, "test.queue");
                assert_eq!(config.prefetch, 4);
                assert_eq!(config.retry_max, 7);
                assert_eq!(config.retry_mode, RetryMode::Requeue);
                assert_eq!(config.dedup_ttl, Duration::from_secs(3600));
            },
        );
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("QUEUE_PREFETCH", Some("lots"), || {
            assert!(matches!(
                ConsumerConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
        temp_env::with_var("QUEUE_RETRY_MODE", Some("forever"), || {
            assert!(ConsumerConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_broker_config_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_CONSUMER_GROUP", Some("listing")),
                ("QUEUE_CLAIM_IDLE_MS", Some("5000")),
                ("QUEUE_MAX_LENGTH", None),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert_eq!(config.consumer_group, "listing");
                assert_eq!(config.claim_idle, Duration::from_secs(5));
                assert_eq!(config.max_length, 100_000);
                assert!(config.consumer_id.starts_with("worker-"));
            },
        );
    }
}
