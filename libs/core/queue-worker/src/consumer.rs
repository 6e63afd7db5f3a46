//! Resilient consumer: dedup, bounded retry and dead-lettering around a
//! domain [`MessageHandler`].
//!
//! Per message:
//!
//! ```text
//! received -> parse --(malformed)--> nack(requeue=false)
//!          -> dedup check --(seen)--> ack (skipped)
//!          -> process --(ok)--> set dedup key, ack
//!                     --(permanent error)--> nack(requeue=false)
//!                     --(transient, budget left)--> retry
//!                     --(transient, budget spent)--> nack(requeue=false)
//! ```
//!
//! The dedup guard is check-then-set and therefore best effort: two
//! consumers racing on the same key can both process it. Handlers must
//! tolerate the rare duplicate.
//!
//! While a handler runs, the consumer heartbeats its delivery at the
//! broker's [`QueueBroker::heartbeat_interval`] so idle reclaim never hands
//! a message that is still being processed to another consumer.

use async_trait::async_trait;
use cache_store::CacheStore;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::AsRefStr;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, QueueBroker, RETRY_COUNT_HEADER};
use crate::client::QueueClient;
use crate::config::{ConsumerConfig, RetryMode};
use crate::error::QueueError;
use crate::metrics::ConsumerMetrics;

const MAX_BACKOFF_SECS: u64 = 30;

/// Domain logic plugged into a [`ResilientConsumer`].
///
/// # Example
///
/// ```rust,ignore
/// struct CompanyListHandler { /* ... */ }
///
/// #[async_trait]
/// impl MessageHandler for CompanyListHandler {
///     type Payload = ListingJobMessage;
///
///     fn name(&self) -> &'static str {
///         "company-list"
///     }
///
///     fn dedup_key(&self, payload: &Self::Payload) -> Option<String> {
///         Some(payload.job_id.clone())
///     }
///
///     async fn process(&self, payload: &Self::Payload) -> Result<(), QueueError> {
///         // fetch, append, update meta
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// JSON payload type. A body that does not decode into it is malformed.
    type Payload: DeserializeOwned + Send + Sync;

    /// Handler name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Dedup key for a payload. `None` disables dedup for that message.
    fn dedup_key(&self, payload: &Self::Payload) -> Option<String>;

    async fn process(&self, payload: &Self::Payload) -> Result<(), QueueError>;

    /// Called after a decodable message was sent to the DLQ.
    async fn on_dead_letter(&self, _payload: &Self::Payload, _reason: &str) {}
}

/// What the consumer did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Processed and acknowledged
    Acked,
    /// Duplicate; acknowledged without processing
    Skipped,
    /// Republished with the given retry count
    Retried { retry_count: u32 },
    /// Put back unchanged with `nack(requeue = true)`
    Requeued,
    /// Sent to the DLQ
    DeadLettered,
}

/// Consumer wrapping a [`MessageHandler`] with dedup, retry and DLQ.
pub struct ResilientConsumer<H: MessageHandler> {
    client: QueueClient,
    broker: Arc<dyn QueueBroker>,
    dedup: Arc<dyn CacheStore>,
    handler: Arc<H>,
    config: ConsumerConfig,
    metrics: ConsumerMetrics,
}

impl<H: MessageHandler> Clone for ResilientConsumer<H> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            broker: self.broker.clone(),
            dedup: self.dedup.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<H: MessageHandler> ResilientConsumer<H> {
    pub fn new(client: QueueClient, dedup: Arc<dyn CacheStore>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        let metrics = ConsumerMetrics::new(&config.queue_name, handler.name());
        Self {
            broker: client.broker(),
            client,
            dedup,
            handler,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Declare the queue and its DLQ.
    pub async fn start(&self) -> Result<(), QueueError> {
        self.config
            .validate()
            .map_err(|e| QueueError::Config(e.to_string()))?;
        self.client
            .assert_queue_with_dlq(&self.config.queue_name, &self.config.dlq_name)
            .await
    }

    /// Consume until the shutdown signal flips to `true`.
    ///
    /// At most `prefetch` messages are in flight at once; each fetch asks
    /// the broker only for as many messages as there are free slots.
    /// In-flight messages are drained before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        self.start().await?;

        info!(
            queue = %self.config.queue_name,
            dlq = %self.config.dlq_name,
            handler = %self.handler.name(),
            prefetch = self.config.prefetch,
            retry_max = self.config.retry_max,
            retry_mode = %self.config.retry_mode,
            "Starting resilient consumer"
        );

        let slots = Arc::new(Semaphore::new(self.config.prefetch));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Message task panicked");
                }
            }

            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping consumer");
                break;
            }

            let first = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let mut permits = vec![first];
            while let Ok(permit) = slots.clone().try_acquire_owned() {
                permits.push(permit);
            }

            let deliveries = match self.broker.fetch(&self.config.queue_name, permits.len()).await {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Broker recovered");
                        consecutive_errors = 0;
                    }
                    deliveries
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS));
                    warn!(error = %e, consecutive_errors, backoff_secs = backoff.as_secs(), "Fetch failed, backing off");
                    drop(permits);
                    if wait_or_shutdown(&mut shutdown, backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                drop(permits);
                if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                    break;
                }
                continue;
            }

            for delivery in deliveries {
                let Some(permit) = permits.pop() else {
                    // Broker returned more than asked; settle the extra later
                    warn!(message_id = %delivery.id, "Broker over-delivered, requeueing");
                    if let Err(e) = self.broker.nack(&delivery, true).await {
                        error!(error = %e, "Failed to requeue over-delivered message");
                    }
                    continue;
                };

                let this = self.clone();
                tasks.spawn(async move {
                    let message_id = delivery.id.clone();
                    match this.handle_delivery(delivery).await {
                        Ok(disposition) => {
                            debug!(message_id = %message_id, disposition = disposition.as_ref(), "Message settled");
                        }
                        Err(e) => {
                            // Unsettled: the broker redelivers it later
                            error!(message_id = %message_id, error = %e, "Failed to settle message");
                        }
                    }
                    drop(permit);
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message task panicked");
            }
        }

        info!(queue = %self.config.queue_name, "Resilient consumer stopped");
        Ok(())
    }

    /// Run one delivery through the state machine and settle it.
    ///
    /// Errors are broker failures while settling; processing failures are
    /// turned into retry or DLQ decisions instead.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Disposition, QueueError> {
        self.metrics.message_received();
        let started = Instant::now();
        let retry_count = delivery.retry_count();

        let payload: H::Payload = match serde_json::from_slice(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    message_id = %delivery.id,
                    error = %e,
                    "Malformed message, dead-lettering without retry"
                );
                self.broker.nack(&delivery, false).await?;
                self.metrics.message_dead_lettered("malformed");
                return Ok(Disposition::DeadLettered);
            }
        };

        let dedup_key = self
            .handler
            .dedup_key(&payload)
            .map(|key| format!("dedup:{}:{}", self.config.queue_name, key));

        if let Some(key) = &dedup_key {
            if self.already_processed(key).await {
                debug!(message_id = %delivery.id, dedup_key = %key, "Duplicate message, skipping");
                self.broker.ack(&delivery).await?;
                self.metrics.message_skipped();
                return Ok(Disposition::Skipped);
            }
        }

        self.metrics.in_flight_inc();
        let result = self.process_holding(&delivery, &payload).await;
        self.metrics.in_flight_dec();

        match result {
            Ok(()) => {
                if let Some(key) = &dedup_key {
                    if let Err(e) = self.dedup.set_ex(key, "1", self.config.dedup_ttl).await {
                        warn!(dedup_key = %key, error = %e, "Failed to record dedup key");
                    }
                }
                self.broker.ack(&delivery).await?;
                self.metrics.message_acked(started.elapsed());
                debug!(message_id = %delivery.id, handler = %self.handler.name(), "Message processed");
                Ok(Disposition::Acked)
            }
            Err(e) => self.handle_failure(&delivery, &payload, e, retry_count).await,
        }
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        payload: &H::Payload,
        err: QueueError,
        retry_count: u32,
    ) -> Result<Disposition, QueueError> {
        let category = err.category();
        self.metrics.message_failed(category.as_ref());

        if err.is_permanent() {
            error!(
                message_id = %delivery.id,
                error = %err,
                "Permanent failure, dead-lettering"
            );
            return self.dead_letter(delivery, payload, &err.to_string(), "permanent").await;
        }

        let next = retry_count.saturating_add(1);
        if next >= self.config.retry_max {
            error!(
                message_id = %delivery.id,
                retry_count,
                retry_max = self.config.retry_max,
                error = %err,
                "Retry budget exhausted, dead-lettering"
            );
            let reason = format!("{} (after {} attempts)", err, next);
            return self.dead_letter(delivery, payload, &reason, "exhausted").await;
        }

        self.metrics.message_retried();
        match self.config.retry_mode {
            RetryMode::Republish => {
                let mut headers = delivery.headers.clone();
                headers.insert(RETRY_COUNT_HEADER.to_string(), next.to_string());
                self.broker.retry(delivery, &headers).await?;
                warn!(message_id = %delivery.id, retry_count = next, error = %err, "Processing failed, republished for retry");
                Ok(Disposition::Retried { retry_count: next })
            }
            RetryMode::Requeue => {
                self.broker.nack(delivery, true).await?;
                warn!(message_id = %delivery.id, error = %err, "Processing failed, requeued");
                Ok(Disposition::Requeued)
            }
        }
    }

    /// Run the handler, heartbeating the delivery so the broker does not
    /// hand it to another consumer while it is still being processed.
    async fn process_holding(&self, delivery: &Delivery, payload: &H::Payload) -> Result<(), QueueError> {
        let Some(every) = self.broker.heartbeat_interval().filter(|every| !every.is_zero()) else {
            return self.handler.process(payload).await;
        };

        let process = self.handler.process(payload);
        tokio::pin!(process);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut process => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.broker.heartbeat(delivery).await {
                        warn!(message_id = %delivery.id, error = %e, "Heartbeat failed, message may be redelivered");
                    }
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        payload: &H::Payload,
        reason: &str,
        label: &str,
    ) -> Result<Disposition, QueueError> {
        self.broker.nack(delivery, false).await?;
        self.metrics.message_dead_lettered(label);
        self.handler.on_dead_letter(payload, reason).await;
        Ok(Disposition::DeadLettered)
    }

    /// Soft read: a failing dedup store counts as "not seen".
    async fn already_processed(&self, key: &str) -> bool {
        match self.dedup.exists(key).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(dedup_key = %key, error = %e, "Dedup lookup failed, processing anyway");
                false
            }
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns `true` on
/// shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Headers;
    use crate::memory::InMemoryBroker;
    use cache_store::InMemoryCacheStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    struct Ping {
        id: String,
        #[serde(default)]
        fail: Option<String>,
    }

    #[derive(Default)]
    struct PingHandler {
        calls: AtomicU32,
        dead: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for PingHandler {
        type Payload = Ping;

        fn name(&self) -> &'static str {
            "ping"
        }

        fn dedup_key(&self, payload: &Ping) -> Option<String> {
            Some(payload.id.clone())
        }

        async fn process(&self, payload: &Ping) -> Result<(), QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match payload.fail.as_deref() {
                Some("transient") => Err(QueueError::transient("upstream timeout")),
                Some("permanent") => Err(QueueError::permanent("bad params")),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn on_dead_letter(&self, payload: &Ping, reason: &str) {
            self.dead.lock().unwrap().push(format!("{}: {}", payload.id, reason));
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        handler: Arc<PingHandler>,
        consumer: ResilientConsumer<PingHandler>,
    }

    async fn fixture(config: ConsumerConfig) -> Fixture {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(PingHandler::default());
        let consumer = ResilientConsumer::new(
            QueueClient::new(Arc::new(broker.clone())),
            Arc::new(InMemoryCacheStore::new()),
            handler.clone(),
            config,
        );
        consumer.start().await.unwrap();
        Fixture { broker, handler, consumer }
    }

    async fn next(broker: &InMemoryBroker) -> Delivery {
        broker.fetch("ping", 1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_success_acks_and_records_dedup() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq")).await;
        f.broker.publish("ping", br#"{"id":"a"}"#, &Headers::new()).await.unwrap();

        let outcome = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();

        assert_eq!(outcome, Disposition::Acked);
        assert_eq!(f.broker.acked_count(), 1);
        assert_eq!(f.broker.unacked_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_processed_once() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq")).await;
        for _ in 0..2 {
            f.broker.publish("ping", br#"{"id":"same"}"#, &Headers::new()).await.unwrap();
        }

        let first = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();
        let second = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();

        assert_eq!(first, Disposition::Acked);
        assert_eq!(second, Disposition::Skipped);
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.broker.acked_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_goes_to_dlq_without_processing() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq")).await;
        f.broker.publish("ping", b"not json", &Headers::new()).await.unwrap();
        f.broker.publish("ping", br#"{"other":1}"#, &Headers::new()).await.unwrap();

        for _ in 0..2 {
            let outcome = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();
            assert_eq!(outcome, Disposition::DeadLettered);
        }

        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.broker.ready_messages("ping.dlq").len(), 2);
        assert!(f.handler.dead.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dead_letters_on_last_attempt() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq").with_retry_max(3)).await;
        f.broker
            .publish("ping", br#"{"id":"r","fail":"transient"}"#, &Headers::new())
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(f.consumer.handle_delivery(next(&f.broker).await).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                Disposition::Retried { retry_count: 1 },
                Disposition::Retried { retry_count: 2 },
                Disposition::DeadLettered,
            ]
        );
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 3);
        assert!(f.broker.ready_messages("ping").is_empty());

        let dead = f.broker.ready_messages("ping.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count(), 2);
        assert_eq!(f.handler.dead.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry_budget() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq")).await;
        f.broker
            .publish("ping", br#"{"id":"p","fail":"permanent"}"#, &Headers::new())
            .await
            .unwrap();

        let outcome = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();

        assert_eq!(outcome, Disposition::DeadLettered);
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
        assert!(f.handler.dead.lock().unwrap()[0].contains("bad params"));
    }

    #[tokio::test]
    async fn test_requeue_mode_never_increments_counter() {
        let f = fixture(
            ConsumerConfig::new("ping", "ping.dlq")
                .with_retry_max(2)
                .with_retry_mode(RetryMode::Requeue),
        )
        .await;
        f.broker
            .publish("ping", br#"{"id":"q","fail":"transient"}"#, &Headers::new())
            .await
            .unwrap();

        for _ in 0..5 {
            let delivery = next(&f.broker).await;
            assert_eq!(delivery.retry_count(), 0);
            let outcome = f.consumer.handle_delivery(delivery).await.unwrap();
            assert_eq!(outcome, Disposition::Requeued);
        }
        assert!(f.broker.ready_messages("ping.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_failed_message_does_not_record_dedup() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq").with_retry_max(5)).await;
        f.broker
            .publish("ping", br#"{"id":"x","fail":"transient"}"#, &Headers::new())
            .await
            .unwrap();

        f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();
        let retried = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();

        assert_eq!(retried, Disposition::Retried { retry_count: 2 });
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_is_not_redelivered_while_running() {
        let broker = InMemoryBroker::new().with_claim_idle(Duration::from_secs(3));
        let handler = Arc::new(PingHandler::default());
        let consumer = ResilientConsumer::new(
            QueueClient::new(Arc::new(broker.clone())),
            Arc::new(InMemoryCacheStore::new()),
            handler.clone(),
            ConsumerConfig::new("ping", "ping.dlq"),
        );
        consumer.start().await.unwrap();
        broker
            .publish("ping", br#"{"id":"s","fail":"slow"}"#, &Headers::new())
            .await
            .unwrap();
        let delivery = next(&broker).await;

        let running = consumer.clone();
        let task = tokio::spawn(async move { running.handle_delivery(delivery).await });

        // Handler runs for 10s against a 3s claim timeout
        for _ in 0..9 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(broker.fetch("ping", 10).await.unwrap().is_empty());
        }

        assert_eq!(task.await.unwrap().unwrap(), Disposition::Acked);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unacked_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_retry_settles_original_exactly_once() {
        let f = fixture(ConsumerConfig::new("ping", "ping.dlq").with_retry_max(3)).await;
        f.broker
            .publish("ping", br#"{"id":"t","fail":"transient"}"#, &Headers::new())
            .await
            .unwrap();

        let outcome = f.consumer.handle_delivery(next(&f.broker).await).await.unwrap();

        assert_eq!(outcome, Disposition::Retried { retry_count: 1 });
        assert_eq!(f.broker.unacked_count("ping"), 0);
        let ready = f.broker.ready_messages("ping");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].retry_count(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let f = fixture(
            ConsumerConfig::new("ping", "ping.dlq")
                .with_prefetch(3)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .await;
        for i in 0..10 {
            let body = format!(r#"{{"id":"m{i}"}}"#);
            f.broker.publish("ping", body.as_bytes(), &Headers::new()).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let consumer = f.consumer.clone();
        let task = tokio::spawn(async move { consumer.run(rx).await });

        for _ in 0..200 {
            if f.broker.acked_count() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(f.broker.acked_count(), 10);
        assert_eq!(f.handler.calls.load(Ordering::SeqCst), 10);
    }
}
