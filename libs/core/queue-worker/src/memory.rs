//! In-process [`QueueBroker`] for tests and local runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::broker::{DEATH_QUEUE_HEADER, Delivery, Headers, QueueBroker, QueueStats};
use crate::error::QueueError;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    /// Unsettled deliveries and when they were last delivered or heartbeated
    unacked: HashMap<String, (Delivery, Instant)>,
    dead_letter: Option<String>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    next_id: u64,
    acked: u64,
    claim_idle: Option<Duration>,
}

/// [`QueueBroker`] over in-process queues.
///
/// Publishing to an undeclared queue creates it, as `XADD` does for
/// streams. With [`with_claim_idle`](Self::with_claim_idle) unsettled
/// messages idle for longer are handed out again, like the Redis binding
/// reclaiming from a dead consumer.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_idle(self, idle: Duration) -> Self {
        self.lock().claim_idle = Some(idle);
        self
    }

    /// Messages waiting to be fetched, in delivery order.
    pub fn ready_messages(&self, queue: &str) -> Vec<Delivery> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of fetched but unsettled messages.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Total acks across all queues.
    pub fn acked_count(&self) -> u64 {
        self.lock().acked
    }

    /// Dead-letter route recorded for a queue.
    pub fn dead_letter_of(&self, queue: &str) -> Option<String> {
        self.lock().queues.get(queue).and_then(|q| q.dead_letter.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn push(&mut self, queue: &str, body: Vec<u8>, headers: Headers) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.queues.entry(queue.to_string()).or_default().ready.push_back(Delivery {
            id: id.clone(),
            queue: queue.to_string(),
            body,
            headers,
        });
        id
    }

    fn unknown(delivery: &Delivery) -> QueueError {
        QueueError::Broker(format!(
            "unknown delivery '{}' on queue '{}'",
            delivery.id, delivery.queue
        ))
    }

    fn take_unacked(&mut self, delivery: &Delivery) -> Result<Delivery, QueueError> {
        self.queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.id))
            .map(|(original, _)| original)
            .ok_or_else(|| Self::unknown(delivery))
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn assert_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let state = inner.queues.entry(queue.to_string()).or_default();
        if let Some(dlq) = dead_letter {
            state.dead_letter = Some(dlq.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<String, QueueError> {
        Ok(self.lock().push(queue, body.to_vec(), headers.clone()))
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut inner = self.lock();
        let claim_idle = inner.claim_idle;
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut taken = Vec::new();

        if let Some(idle) = claim_idle {
            let mut stale: Vec<&mut (Delivery, Instant)> = state
                .unacked
                .values_mut()
                .filter(|(_, seen)| now.duration_since(*seen) >= idle)
                .collect();
            stale.sort_by_key(|(delivery, _)| delivery.id.parse::<u64>().unwrap_or(u64::MAX));
            for entry in stale.into_iter().take(max) {
                entry.1 = now;
                taken.push(entry.0.clone());
            }
        }

        while taken.len() < max {
            let Some(delivery) = state.ready.pop_front() else {
                break;
            };
            state.unacked.insert(delivery.id.clone(), (delivery.clone(), now));
            taken.push(delivery);
        }
        Ok(taken)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.take_unacked(delivery)?;
        inner.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let original = inner.take_unacked(delivery)?;

        if requeue {
            inner.push(&original.queue, original.body, original.headers);
            return Ok(());
        }

        let dead_letter = inner.queues.get(&original.queue).and_then(|q| q.dead_letter.clone());
        if let Some(dlq) = dead_letter {
            let mut headers = original.headers;
            headers.insert(DEATH_QUEUE_HEADER.to_string(), original.queue.clone());
            inner.push(&dlq, original.body, headers);
        }
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, headers: &Headers) -> Result<String, QueueError> {
        let mut inner = self.lock();
        let original = inner.take_unacked(delivery)?;
        inner.acked += 1;
        Ok(inner.push(&original.queue, original.body, headers.clone()))
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let entry = inner
            .queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.get_mut(&delivery.id))
            .ok_or_else(|| Inner::unknown(delivery))?;
        entry.1 = Instant::now();
        Ok(())
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        self.lock().claim_idle.map(|idle| idle / 3)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let inner = self.lock();
        let (length, pending) = inner
            .queues
            .get(queue)
            .map_or((0, 0), |q| (q.ready.len() + q.unacked.len(), q.unacked.len()));
        Ok(QueueStats {
            queue: queue.to_string(),
            length: length as u64,
            pending: pending as u64,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
