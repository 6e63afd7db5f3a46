//! Durable storage of notifications.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_parse, env_required};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::NotificationEvent;

/// Where notifications are recorded before they are pushed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Upsert by message id; saving the same event twice is harmless.
    async fn save(&self, event: &NotificationEvent) -> DeliveryResult<()>;

    /// Mark as delivered. Returns `false` when the notification is unknown.
    async fn mark_delivered(&self, message_id: &str) -> DeliveryResult<bool>;
}

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub token: Option<String>,
}

impl FromEnv for HttpSinkConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: env_required("CORE_API_URL")?.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(env_parse("CORE_API_TIMEOUT_MS", 10_000u64)?),
            token: std::env::var("CORE_API_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}

/// [`NotificationSink`] over the core API's internal notification endpoints.
#[derive(Clone)]
pub struct HttpNotificationSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpNotificationSink {
    pub fn new(config: HttpSinkConfig) -> DeliveryResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn rejected(status: StatusCode, body: String) -> DeliveryError {
    DeliveryError::Persistence {
        message: format!("core API responded {status}: {body}"),
        transient: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn save(&self, event: &NotificationEvent) -> DeliveryResult<()> {
        let url = format!("{}/internal/notifications", self.config.base_url);
        let response = self.authorized(self.client.put(&url).json(event)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(message_id = %event.message_id, status = %status, "Failed to save notification");
            return Err(rejected(status, body));
        }
        debug!(message_id = %event.message_id, "Saved notification");
        Ok(())
    }

    async fn mark_delivered(&self, message_id: &str) -> DeliveryResult<bool> {
        let url = format!("{}/internal/notifications/{}/delivered", self.config.base_url, message_id);
        let response = self.authorized(self.client.post(&url)).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(rejected(status, body))
            }
        }
    }
}
