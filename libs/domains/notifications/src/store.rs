//! Delivery confirmation store.
//!
//! A pending delivery lives under `delivery:pending:{message_id}` until the
//! client confirms it or its TTL runs out. An expired entry looks exactly
//! like one that never existed.

use cache_store::CacheStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::DeliveryResult;
use crate::models::{DeliveryMetadata, PendingDelivery};

const KEY_PREFIX: &str = "delivery:pending";

#[derive(Clone)]
pub struct DeliveryConfirmationStore {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl DeliveryConfirmationStore {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(message_id: &str) -> String {
        format!("{KEY_PREFIX}:{message_id}")
    }

    /// Record a pending delivery, replacing any entry with the same id.
    pub async fn store_pending_delivery(
        &self,
        message_id: &str,
        payload: Value,
        metadata: DeliveryMetadata,
    ) -> DeliveryResult<()> {
        let pending = PendingDelivery {
            payload,
            metadata,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&pending)?;
        self.store.set_ex(&Self::key(message_id), &raw, self.ttl).await?;
        debug!(message_id, "Stored pending delivery");
        Ok(())
    }

    /// Atomically take the pending delivery. `None` when already confirmed
    /// or expired.
    pub async fn confirm_delivery(&self, message_id: &str) -> DeliveryResult<Option<PendingDelivery>> {
        let Some(raw) = self.store.get_del(&Self::key(message_id)).await? else {
            debug!(message_id, "Nothing pending to confirm");
            return Ok(None);
        };
        let pending: PendingDelivery = serde_json::from_str(&raw)?;
        info!(message_id, user_id = %pending.metadata.user_id, "Delivery confirmed");
        Ok(Some(pending))
    }

    pub async fn is_pending(&self, message_id: &str) -> DeliveryResult<bool> {
        Ok(self.store.exists(&Self::key(message_id)).await?)
    }

    pub async fn get_pending_delivery(&self, message_id: &str) -> DeliveryResult<Option<PendingDelivery>> {
        match self.store.get(&Self::key(message_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Cancel a pending delivery. Returns whether one existed.
    pub async fn remove_pending_delivery(&self, message_id: &str) -> DeliveryResult<bool> {
        Ok(self.store.del(&[Self::key(message_id)]).await? > 0)
    }

    /// Number of pending deliveries. Scans every pending key.
    pub async fn get_pending_count(&self) -> DeliveryResult<u64> {
        let keys = self.store.scan_keys(&format!("{KEY_PREFIX}:*")).await?;
        Ok(keys.len() as u64)
    }

    /// Drop entries older than the TTL or that no longer decode.
    ///
    /// The TTL removes entries on its own; this sweeps what outlived it,
    /// e.g. keys whose expiry was cleared by hand. Scans every pending key.
    pub async fn cleanup_expired(&self) -> DeliveryResult<u64> {
        let keys = self.store.scan_keys(&format!("{KEY_PREFIX}:*")).await?;
        let max_age = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut stale = Vec::new();
        for (key, raw) in keys.iter().zip(self.store.get_many(&keys).await?) {
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<PendingDelivery>(&raw) {
                Ok(pending) if now - pending.created_at <= max_age => {}
                Ok(_) => stale.push(key.clone()),
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping undecodable pending delivery");
                    stale.push(key.clone());
                }
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }
        let removed = self.store.del(&stale).await?;
        info!(removed, "Cleaned up stale pending deliveries");
        Ok(removed)
    }

    /// Poll until the entry disappears or `timeout` elapses.
    ///
    /// Returns `true` when the entry was taken within the window. Only
    /// meaningful for `timeout` below the TTL, otherwise expiry is
    /// indistinguishable from confirmation.
    pub async fn wait_for_confirmation(
        &self,
        message_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> DeliveryResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_pending(message_id).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
