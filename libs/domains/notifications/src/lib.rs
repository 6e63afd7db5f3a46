//! Notifications Domain
//!
//! Realtime notification dispatch with delivery confirmation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ NotificationService │  ← Validates and enqueues events
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ notifications queue │  ← notifications.realtime (+ .dlq)
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼─────────────┐     ┌────────────────────────────┐
//! │ NotificationDispatcher │ ──► │ DeliveryConfirmationStore  │
//! └──────────┬─────────────┘     └─────────────▲──────────────┘
//!            │                                 │ acknowledge(messageId)
//! ┌──────────▼──────────┐              ┌───────┴────────┐
//! │ RealtimePublisher   │ ───────────► │ client gateway │
//! └─────────────────────┘              └────────────────┘
//! ```
//!
//! A pending delivery that is not confirmed before its TTL is gone, and
//! reads exactly like one that never existed. The dispatcher can wait a
//! bounded time for the confirmation and turn a miss into a retryable
//! failure.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod realtime;
pub mod sink;
pub mod store;

pub use config::DeliveryConfirmationConfig;
pub use dispatcher::{NotificationDispatcher, NotificationQueue, NotificationService};
pub use error::{DeliveryError, DeliveryResult};
pub use models::{DeliveryMetadata, NotificationEvent, PendingDelivery, RealtimeEnvelope};
pub use realtime::{RealtimePublisher, RedisRealtimePublisher};
pub use sink::{HttpNotificationSink, HttpSinkConfig, NotificationSink};
pub use store::DeliveryConfirmationStore;
