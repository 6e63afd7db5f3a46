//! Broker contract shared by the Redis Streams and in-memory bindings.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::QueueError;

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// Failed-attempt counter carried by republished messages.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Queue a dead-lettered message came from.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

/// A message handed to a consumer, not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, unique per queue
    pub id: String,
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl Delivery {
    /// Retry counter from the headers. Missing or unparsable counts as 0.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

/// Point-in-time size of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    /// Entries held by the queue
    pub length: u64,
    /// Delivered but not yet settled
    pub pending: u64,
}

/// Broker operations the consumer and producers are written against.
///
/// Every delivery must be settled exactly once with [`ack`](Self::ack) or
/// [`nack`](Self::nack); the broker never auto-acks. An unsettled delivery
/// is redelivered once its consumer goes away.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Declare a queue. With `dead_letter`, rejected messages
    /// (`nack(requeue = false)`) are routed there. Idempotent.
    async fn assert_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<(), QueueError>;

    /// Append a message, returning its id.
    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<String, QueueError>;

    /// Take up to `max` messages without waiting. Taken messages stay
    /// unacknowledged until settled.
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reject a message. `requeue = true` puts it back unchanged;
    /// `requeue = false` routes it to the dead-letter queue, or drops it if
    /// the queue has none.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Publish a copy of the message with `headers` and ack the original,
    /// as one step. Returns the id of the copy.
    async fn retry(&self, delivery: &Delivery, headers: &Headers) -> Result<String, QueueError>;

    /// Reset the idle clock of an unsettled delivery so it is not
    /// reclaimed while its handler is still running.
    async fn heartbeat(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    /// How often a consumer must call [`heartbeat`](Self::heartbeat) while
    /// processing. `None` when the broker never reclaims unsettled messages.
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Connectivity probe used by readiness checks.
    async fn ping(&self) -> Result<(), QueueError>;
}
