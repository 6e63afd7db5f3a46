use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Realtime notification event consumed from the notifications queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Unique per event; used for dedup and delivery confirmation
    #[validate(length(min = 1, max = 128))]
    pub message_id: String,
    #[validate(length(min = 1))]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// Event kind, e.g. `invite.received`
    #[validate(length(min = 1, max = 64))]
    pub kind: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2000))]
    pub body: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(user_id: impl Into<String>, kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            company_id: None,
            kind: kind.into(),
            title: title.into(),
            body: None,
            data: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Routing metadata stored alongside a pending delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMetadata {
    pub user_id: String,
    #[serde(default)]
    pub company_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Queue the event was consumed from
    pub queue: String,
}

/// A realtime push awaiting client confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelivery {
    pub payload: Value,
    pub metadata: DeliveryMetadata,
    pub created_at: DateTime<Utc>,
}

/// Message pushed on a user's realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEnvelope {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    /// Whether the client must confirm with the message id
    pub requires_ack: bool,
}
