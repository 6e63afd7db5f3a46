//! Realtime notification dispatch.
//!
//! ```text
//! queue ─► save (sink) ─► store pending ─► publish ─► [wait for ack] ─► ack
//!                                                          │
//!                                              unconfirmed: transient error
//! ```

use async_trait::async_trait;
use chrono::Utc;
use queue_worker::{MessageHandler, QueueClient, QueueDef, QueueError};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::config::DeliveryConfirmationConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{DeliveryMetadata, NotificationEvent, RealtimeEnvelope};
use crate::realtime::RealtimePublisher;
use crate::sink::NotificationSink;
use crate::store::DeliveryConfirmationStore;

pub struct NotificationQueue;

impl QueueDef for NotificationQueue {
    const QUEUE_NAME: &'static str = "notifications.realtime";
    const DLQ_NAME: &'static str = "notifications.realtime.dlq";
}

/// Producer side: validates and enqueues events.
#[derive(Clone)]
pub struct NotificationService {
    queue: QueueClient,
}

impl NotificationService {
    pub fn new(queue: QueueClient) -> Self {
        Self { queue }
    }

    #[instrument(skip(self, event), fields(message_id = %event.message_id, user_id = %event.user_id))]
    pub async fn enqueue(&self, event: &NotificationEvent) -> DeliveryResult<String> {
        event.validate()?;
        self.queue
            .assert_queue_with_dlq(NotificationQueue::QUEUE_NAME, NotificationQueue::DLQ_NAME)
            .await?;
        Ok(self.queue.publish_json(NotificationQueue::QUEUE_NAME, event).await?)
    }
}

/// Consumer side: persists, pushes and tracks confirmation.
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    publisher: Arc<dyn RealtimePublisher>,
    confirmations: DeliveryConfirmationStore,
    config: DeliveryConfirmationConfig,
}

impl NotificationDispatcher {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        publisher: Arc<dyn RealtimePublisher>,
        confirmations: DeliveryConfirmationStore,
        config: DeliveryConfirmationConfig,
    ) -> Self {
        Self {
            sink,
            publisher,
            confirmations,
            config,
        }
    }

    pub fn confirmations(&self) -> &DeliveryConfirmationStore {
        &self.confirmations
    }

    /// Client acknowledgement. Returns `false` when nothing was pending.
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, message_id: &str) -> DeliveryResult<bool> {
        if self.confirmations.confirm_delivery(message_id).await?.is_none() {
            return Ok(false);
        }
        match self.sink.mark_delivered(message_id).await {
            Ok(true) => {}
            Ok(false) => warn!(message_id, "Confirmed notification is unknown to the sink"),
            Err(e) => warn!(message_id, error = %e, "Failed to mark notification delivered"),
        }
        Ok(true)
    }

    #[instrument(skip(self, event), fields(message_id = %event.message_id, user_id = %event.user_id))]
    async fn dispatch(&self, event: &NotificationEvent) -> DeliveryResult<()> {
        event.validate()?;

        // Persist first: an unconfirmed push must never lose the notification
        self.sink.save(event).await?;

        let payload = serde_json::to_value(event)?;
        let metadata = DeliveryMetadata {
            user_id: event.user_id.clone(),
            company_id: event.company_id.clone(),
            timestamp: Utc::now(),
            queue: NotificationQueue::QUEUE_NAME.to_string(),
        };
        self.confirmations
            .store_pending_delivery(&event.message_id, payload.clone(), metadata)
            .await?;

        let envelope = RealtimeEnvelope {
            message_id: event.message_id.clone(),
            kind: event.kind.clone(),
            payload,
            requires_ack: true,
        };
        let receivers = match self.publisher.publish(&event.user_id, &envelope).await {
            Ok(receivers) => receivers,
            Err(e) => {
                self.confirmations.remove_pending_delivery(&event.message_id).await?;
                return Err(e);
            }
        };
        debug!(receivers, "Pushed notification");

        let Some(wait) = self.config.wait else {
            return Ok(());
        };

        let confirmed = self
            .confirmations
            .wait_for_confirmation(&event.message_id, wait, self.config.poll_interval)
            .await?;
        if !confirmed {
            self.confirmations.remove_pending_delivery(&event.message_id).await?;
            return Err(DeliveryError::Unconfirmed(event.message_id.clone()));
        }

        info!("Notification delivered");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for NotificationDispatcher {
    type Payload = NotificationEvent;

    fn name(&self) -> &'static str {
        "notification-dispatch"
    }

    fn dedup_key(&self, event: &NotificationEvent) -> Option<String> {
        Some(event.message_id.clone())
    }

    async fn process(&self, event: &NotificationEvent) -> Result<(), QueueError> {
        self.dispatch(event).await.map_err(QueueError::from)
    }

    async fn on_dead_letter(&self, event: &NotificationEvent, reason: &str) {
        warn!(message_id = %event.message_id, user_id = %event.user_id, reason, "Notification was never delivered in realtime");
        if let Err(e) = self.confirmations.remove_pending_delivery(&event.message_id).await {
            warn!(message_id = %event.message_id, error = %e, "Failed to clear pending delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::MockRealtimePublisher;
    use crate::sink::MockNotificationSink;
    use cache_store::InMemoryCacheStore;
    use mockall::predicate::eq;
    use std::time::Duration;

    fn event() -> NotificationEvent {
        NotificationEvent::new("user-1", "invite.received", "You have a new invite").with_company("c1")
    }

    fn confirmations() -> DeliveryConfirmationStore {
        DeliveryConfirmationStore::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(30))
    }

    fn dispatcher(
        sink: MockNotificationSink,
        publisher: MockRealtimePublisher,
        confirmations: DeliveryConfirmationStore,
        config: DeliveryConfirmationConfig,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(Arc::new(sink), Arc::new(publisher), confirmations, config)
    }

    #[tokio::test]
    async fn test_dispatch_without_wait_leaves_delivery_pending() {
        let event = event();
        let mut sink = MockNotificationSink::new();
        sink.expect_save().times(1).returning(|_| Ok(()));
        let mut publisher = MockRealtimePublisher::new();
        publisher
            .expect_publish()
            .withf(|user_id, envelope| user_id == "user-1" && envelope.requires_ack)
            .times(1)
            .returning(|_, _| Ok(1));

        let dispatcher = dispatcher(sink, publisher, confirmations(), DeliveryConfirmationConfig::default());
        dispatcher.process(&event).await.unwrap();

        let pending = dispatcher
            .confirmations()
            .get_pending_delivery(&event.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.metadata.user_id, "user-1");
        assert_eq!(pending.metadata.company_id.as_deref(), Some("c1"));
        assert_eq!(pending.metadata.queue, "notifications.realtime");
        assert_eq!(pending.payload["title"], "You have a new invite");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_delivery_is_transient_failure() {
        let event = event();
        let mut sink = MockNotificationSink::new();
        sink.expect_save().times(1).returning(|_| Ok(()));
        let mut publisher = MockRealtimePublisher::new();
        publisher.expect_publish().times(1).returning(|_, _| Ok(0));

        let config = DeliveryConfirmationConfig::default()
            .with_wait(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(200));
        let dispatcher = dispatcher(sink, publisher, confirmations(), config);

        let err = dispatcher.process(&event).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(!dispatcher.confirmations().is_pending(&event.message_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_within_wait_succeeds() {
        let event = event();
        let message_id = event.message_id.clone();

        let mut sink = MockNotificationSink::new();
        sink.expect_save().times(1).returning(|_| Ok(()));
        sink.expect_mark_delivered()
            .with(eq(message_id.clone()))
            .times(1)
            .returning(|_| Ok(true));
        let mut publisher = MockRealtimePublisher::new();
        publisher.expect_publish().times(1).returning(|_, _| Ok(1));

        let config = DeliveryConfirmationConfig::default()
            .with_wait(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(100));
        let dispatcher = Arc::new(dispatcher(sink, publisher, confirmations(), config));

        let client = dispatcher.clone();
        let ack_id = message_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            assert!(client.acknowledge(&ack_id).await.unwrap());
        });

        dispatcher.process(&event).await.unwrap();
        assert!(!dispatcher.acknowledge(&message_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_failure_clears_pending() {
        let event = event();
        let mut sink = MockNotificationSink::new();
        sink.expect_save().times(1).returning(|_| Ok(()));
        let mut publisher = MockRealtimePublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(DeliveryError::Publish("connection reset".into())));

        let dispatcher = dispatcher(sink, publisher, confirmations(), DeliveryConfirmationConfig::default());
        let err = dispatcher.process(&event).await.unwrap_err();

        assert!(!err.is_permanent());
        assert!(!dispatcher.confirmations().is_pending(&event.message_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_event_is_permanent_and_not_saved() {
        let mut invalid = event();
        invalid.title = String::new();

        let mut sink = MockNotificationSink::new();
        sink.expect_save().never();
        let mut publisher = MockRealtimePublisher::new();
        publisher.expect_publish().never();

        let dispatcher = dispatcher(sink, publisher, confirmations(), DeliveryConfirmationConfig::default());
        let err = dispatcher.process(&invalid).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_dedup_key_is_message_id() {
        let dispatcher = dispatcher(
            MockNotificationSink::new(),
            MockRealtimePublisher::new(),
            confirmations(),
            DeliveryConfirmationConfig::default(),
        );
        let event = event();
        assert_eq!(dispatcher.dedup_key(&event), Some(event.message_id.clone()));
    }
}
