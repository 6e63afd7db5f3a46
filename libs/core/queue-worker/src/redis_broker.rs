//! Redis Streams binding of [`QueueBroker`].
//!
//! Each queue is a stream read through one consumer group. An entry stores
//! the body under `body` and each header under `h:<name>`. Entries that a
//! crashed consumer left pending are reclaimed with `XPENDING` + `XCLAIM`
//! once idle longer than `claim_idle`. Entries this process still holds are
//! never reclaimed by it, and the consumer heartbeats them (`XCLAIM ...
//! JUSTID`) so other processes see them as busy.

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{DEATH_QUEUE_HEADER, Delivery, Headers, QueueBroker, QueueStats};
use crate::config::BrokerConfig;
use crate::error::QueueError;

const BODY_FIELD: &str = "body";
const HEADER_PREFIX: &str = "h:";

type StreamEntry = (String, Vec<(String, Vec<u8>)>);
type StreamReply = Vec<(String, Vec<StreamEntry>)>;

/// [`QueueBroker`] over Redis Streams.
#[derive(Clone)]
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    config: BrokerConfig,
    dead_letters: Arc<RwLock<HashMap<String, String>>>,
    /// `(queue, id)` of deliveries fetched and not yet settled here
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl RedisStreamBroker {
    pub fn new(redis: ConnectionManager, config: BrokerConfig) -> Self {
        Self {
            redis,
            config,
            dead_letters: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn dead_letter_of(&self, queue: &str) -> Option<String> {
        self.dead_letters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(queue)
            .cloned()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hold(&self, deliveries: &[Delivery]) {
        let mut held = self.held();
        for delivery in deliveries {
            held.insert((delivery.queue.clone(), delivery.id.clone()));
        }
    }

    fn release(&self, delivery: &Delivery) {
        self.held().remove(&(delivery.queue.clone(), delivery.id.clone()));
    }

    async fn create_group(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg("0") // entries published before the group existed are still consumed
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(queue = %queue, group = %self.config.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue = %queue, group = %self.config.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Claim entries other consumers left pending for too long.
    async fn claim_idle(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let idle_ms = self.config.claim_idle.as_millis() as u64;

        let pending: RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::Redis(e)),
        };

        let pending: Vec<String> = {
            let held = self.held();
            pending
                .into_iter()
                .map(|(id, _, _, _)| id)
                .filter(|id| !held.contains(&(queue.to_string(), id.clone())))
                .collect()
        };
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(queue)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(idle_ms);
        for id in &pending {
            cmd.arg(id);
        }

        let entries: Vec<StreamEntry> = cmd.query_async(&mut conn).await?;
        if !entries.is_empty() {
            warn!(queue = %queue, count = entries.len(), "Claimed abandoned messages");
        }
        Ok(entries.into_iter().map(|entry| to_delivery(queue, entry)).collect())
    }

    async fn read_new(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<Option<StreamReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(max)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(streams)) => Ok(streams
                .into_iter()
                .flat_map(|(_, entries)| entries)
                .map(|entry| to_delivery(queue, entry))
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                // Group vanished (stream deleted); recreate and try next poll
                warn!(queue = %queue, "Consumer group missing, recreating");
                self.create_group(queue).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    fn xadd(&self, queue: &str, body: &[u8], headers: &Headers) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_length)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body);
        for (name, value) in headers {
            cmd.arg(format!("{HEADER_PREFIX}{name}")).arg(value);
        }
        cmd
    }

    fn xack(&self, delivery: &Delivery) -> redis::Cmd {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&delivery.queue)
            .arg(&self.config.consumer_group)
            .arg(&delivery.id);
        cmd
    }
}

fn to_delivery(queue: &str, (id, fields): StreamEntry) -> Delivery {
    let mut body = Vec::new();
    let mut headers = Headers::new();

    for (field, value) in fields {
        if field == BODY_FIELD {
            body = value;
        } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
            headers.insert(name.to_string(), String::from_utf8_lossy(&value).into_owned());
        }
    }

    Delivery {
        id,
        queue: queue.to_string(),
        body,
        headers,
    }
}

#[async_trait]
impl QueueBroker for RedisStreamBroker {
    async fn assert_queue(&self, queue: &str, dead_letter: Option<&str>) -> Result<(), QueueError> {
        self.create_group(queue).await?;

        if let Some(dlq) = dead_letter {
            self.dead_letters
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(queue.to_string(), dlq.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<String, QueueError> {
        let mut conn = self.redis.clone();
        let id: String = self.xadd(queue, body, headers).query_async(&mut conn).await?;
        debug!(queue = %queue, message_id = %id, "Published message");
        Ok(id)
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut deliveries = self.claim_idle(queue, max).await?;
        if deliveries.len() < max {
            deliveries.extend(self.read_new(queue, max - deliveries.len()).await?);
        }
        self.hold(&deliveries);
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: u64 = self.xack(delivery).query_async(&mut conn).await?;
        self.release(delivery);
        debug!(queue = %delivery.queue, message_id = %delivery.id, "Acknowledged message");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let target = if requeue {
            Some((delivery.queue.clone(), delivery.headers.clone()))
        } else {
            self.dead_letter_of(&delivery.queue).map(|dlq| {
                let mut headers = delivery.headers.clone();
                headers.insert(DEATH_QUEUE_HEADER.to_string(), delivery.queue.clone());
                (dlq, headers)
            })
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some((queue, headers)) = &target {
            pipe.add_command(self.xadd(queue, &delivery.body, headers)).ignore();
        } else {
            warn!(queue = %delivery.queue, message_id = %delivery.id, "No dead-letter route, dropping message");
        }
        pipe.add_command(self.xack(delivery)).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        self.release(delivery);

        debug!(queue = %delivery.queue, message_id = %delivery.id, requeue, "Rejected message");
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, headers: &Headers) -> Result<String, QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(self.xadd(&delivery.queue, &delivery.body, headers))
            .add_command(self.xack(delivery))
            .ignore();
        let (id,): (String,) = pipe.query_async(&mut conn).await?;
        self.release(delivery);

        debug!(queue = %delivery.queue, message_id = %delivery.id, retry_id = %id, "Republished message for retry");
        Ok(id)
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&delivery.queue)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(0)
            .arg(&delivery.id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        if claimed.is_empty() {
            return Err(QueueError::Broker(format!(
                "delivery '{}' on '{}' is no longer pending",
                delivery.id, delivery.queue
            )));
        }
        Ok(())
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        Some(self.config.claim_idle / 3)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let length: u64 = redis::cmd("XLEN").arg(queue).query_async(&mut conn).await?;

        let pending: RedisResult<(u64, Option<String>, Option<String>, Option<Vec<(String, String)>>)> =
            redis::cmd("XPENDING")
                .arg(queue)
                .arg(&self.config.consumer_group)
                .query_async(&mut conn)
                .await;

        Ok(QueueStats {
            queue: queue.to_string(),
            length,
            pending: pending.map(|(count, _, _, _)| count).unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(QueueError::Broker(format!("unexpected PING response: {response}")));
        }
        Ok(())
    }
}
