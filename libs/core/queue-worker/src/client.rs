//! Queue client used by producers (job services) and the consumer.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

use crate::broker::{Headers, QueueBroker};
use crate::error::QueueError;

/// "Assert queue + DLQ pair" and "publish" on top of a [`QueueBroker`].
///
/// Asserted pairs are remembered so hot publish paths declare each queue
/// once per process.
#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn QueueBroker>,
    asserted: Arc<Mutex<HashSet<(String, String)>>>,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            asserted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn broker(&self) -> Arc<dyn QueueBroker> {
        self.broker.clone()
    }

    /// Declare the DLQ as a plain queue, then the main queue routing
    /// rejected messages to it.
    pub async fn assert_queue_with_dlq(&self, queue: &str, dlq: &str) -> Result<(), QueueError> {
        let pair = (queue.to_string(), dlq.to_string());
        if self.is_asserted(&pair) {
            return Ok(());
        }

        self.broker.assert_queue(dlq, None).await?;
        self.broker.assert_queue(queue, Some(dlq)).await?;

        debug!(queue, dlq, "Asserted queue with dead-letter queue");
        self.asserted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pair);
        Ok(())
    }

    /// Publish raw bytes without headers.
    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<String, QueueError> {
        self.broker.publish(queue, body, &Headers::new()).await
    }

    /// Serialize `message` as JSON and publish it.
    #[instrument(skip(self, message))]
    pub async fn publish_json<T: Serialize + Sync>(&self, queue: &str, message: &T) -> Result<String, QueueError> {
        let body = serde_json::to_vec(message)?;
        let id = self.publish(queue, &body).await?;
        debug!(message_id = %id, "Published JSON message");
        Ok(id)
    }

    fn is_asserted(&self, pair: &(String, String)) -> bool {
        self.asserted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(pair)
    }
}
