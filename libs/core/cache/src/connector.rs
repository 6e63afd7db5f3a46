use core_config::redis::RedisConfig;
use redis::Client;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::retry::{RetryConfig, retry_with_backoff};

/// Connect to Redis and verify the connection with `PING`.
///
/// The returned `ConnectionManager` reconnects on its own after transient
/// failures and is cheap to clone.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("Connecting to Redis");

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Connect using a [`RedisConfig`], retrying with backoff.
///
/// Startup ordering in k8s is not guaranteed, so the worker tolerates Redis
/// coming up a few seconds after it.
pub async fn connect_from_config_with_retry(
    config: &RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    let url = config.url.clone();
    retry_with_backoff(|| connect(&url), retry_config.unwrap_or_default()).await
}

/// `PING` health check used by readiness probes.
pub async fn check_health(conn: &mut ConnectionManager) -> CacheResult<()> {
    debug!("Running Redis health check");

    let response: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| CacheError::HealthCheckFailed(e.to_string()))?;

    if response != "PONG" {
        return Err(CacheError::HealthCheckFailed(format!(
            "unexpected PING response: {}",
            response
        )));
    }

    Ok(())
}
