//! Queue Worker Framework
//!
//! Queue plumbing for background jobs: a broker abstraction with a Redis
//! Streams binding, a queue client for producers, and a resilient consumer
//! that wraps domain handlers with deduplication, bounded retries and a
//! dead-letter queue.
//!
//! ## Features
//!
//! - **Broker abstraction**: `QueueBroker` with `RedisStreamBroker` and
//!   `InMemoryBroker`
//! - **Explicit settlement**: every delivery is acked or nacked, never
//!   auto-acked
//! - **Dedup**: best-effort "already processed" markers in the cache store
//! - **Bounded retry**: `x-retry-count` header, DLQ on exhaustion
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{ConsumerConfig, QueueClient, ResilientConsumer};
//!
//! let client = QueueClient::new(broker);
//! let config = ConsumerConfig::from_env_for::<CompanyListQueue>()?;
//! let consumer = ResilientConsumer::new(client, cache, Arc::new(handler), config);
//! consumer.run(shutdown_rx).await?;
//! ```

mod broker;
mod client;
mod config;
mod consumer;
mod error;
mod health;
mod memory;
pub mod metrics;
mod redis_broker;
mod registry;

pub use broker::{DEATH_QUEUE_HEADER, Delivery, Headers, QueueBroker, QueueStats, RETRY_COUNT_HEADER};
pub use client::QueueClient;
pub use config::{BrokerConfig, ConsumerConfig, RetryMode};
pub use consumer::{Disposition, MessageHandler, ResilientConsumer};
pub use error::{ErrorCategory, QueueError};
pub use health::{HealthState, QueueReport, health_router};
pub use memory::InMemoryBroker;
pub use metrics::{ConsumerMetrics, init_metrics};
pub use redis_broker::RedisStreamBroker;
pub use registry::QueueDef;
