//! Realtime push channel.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::RealtimeEnvelope;

/// Pushes an envelope to a user's connected clients.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    /// Returns how many subscribers received the envelope.
    async fn publish(&self, user_id: &str, envelope: &RealtimeEnvelope) -> DeliveryResult<u64>;
}

/// Redis pub/sub on `realtime:user:{user_id}`; the WebSocket gateway
/// subscribes per connected user.
#[derive(Clone)]
pub struct RedisRealtimePublisher {
    redis: ConnectionManager,
}

impl RedisRealtimePublisher {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub fn channel(user_id: &str) -> String {
        format!("realtime:user:{user_id}")
    }
}

#[async_trait]
impl RealtimePublisher for RedisRealtimePublisher {
    async fn publish(&self, user_id: &str, envelope: &RealtimeEnvelope) -> DeliveryResult<u64> {
        let payload = serde_json::to_string(envelope)?;
        let channel = Self::channel(user_id);
        let mut conn = self.redis.clone();

        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::Publish(e.to_string()))?;

        debug!(channel = %channel, message_id = %envelope.message_id, receivers, "Published realtime event");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(RedisRealtimePublisher::channel("u-42"), "realtime:user:u-42");
    }
}
