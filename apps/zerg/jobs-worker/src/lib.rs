//! Jobs Worker Service
//!
//! A background worker that fills listing jobs and pushes realtime
//! notifications, both fed from Redis-stream queues.
//!
//! ## Architecture
//!
//! ```text
//! jobs.{domain} (x6)                 notifications.realtime
//!   ↓ (Consumer Group: jobs-workers)   ↓
//! ResilientConsumer<ListingProcessor>  ResilientConsumer<NotificationDispatcher>
//!   ↓ fetch chunks (core API)          ↓ persist (core API) + PUBLISH realtime:user:{id}
//! JobCache (Redis)                     DeliveryConfirmationStore (Redis)
//! ```
//!
//! ## Features
//!
//! - Dedup, bounded retry and a dead-letter queue per consumer
//! - Graceful shutdown: in-flight messages drain before exit
//! - Periodic sweep of stale pending deliveries
//! - Health check endpoint for Kubernetes probes

use axum::Router;
use cache_store::{CacheStore, RedisCacheStore};
use core_config::{ConfigError, Environment, FromEnv, app_info, env_parse, redis::RedisConfig};
use domain_jobs::{
    ChunkSource, CompanyList, FriendshipList, HttpChunkSource, HttpSourceConfig, InviteBulk, InviteList,
    ListingConfig, ListingDomain, ListingProcessor, NotificationList, UserSearch,
};
use domain_notifications::{
    DeliveryConfirmationConfig, DeliveryConfirmationStore, HttpNotificationSink, HttpSinkConfig,
    NotificationDispatcher, NotificationQueue, RedisRealtimePublisher,
};
use eyre::{Result, WrapErr};
use queue_worker::{
    BrokerConfig, ConsumerConfig, HealthState, MessageHandler, QueueClient, QueueDef, RedisStreamBroker,
    ResilientConsumer, health_router, metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Process-level settings not owned by any library crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub health_port: u16,
    /// Interval of the stale pending-delivery sweep
    pub cleanup_interval: Duration,
}

impl FromEnv for WorkerSettings {
    /// `JOBS_WORKER_HEALTH_PORT` wins over `HEALTH_PORT`; default 8083.
    fn from_env() -> Result<Self, ConfigError> {
        let health_port = match std::env::var("JOBS_WORKER_HEALTH_PORT") {
            Ok(_) => env_parse("JOBS_WORKER_HEALTH_PORT", 8083u16)?,
            Err(_) => env_parse("HEALTH_PORT", 8083u16)?,
        };
        Ok(Self {
            health_port,
            cleanup_interval: Duration::from_secs(env_parse("DELIVERY_CLEANUP_INTERVAL_SECONDS", 300u64)?),
        })
    }
}

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue monitoring: `/queues`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Build the consumer for one handler and run it on the join set.
fn spawn_consumer<H: MessageHandler>(
    consumers: &mut JoinSet<(String, Result<()>)>,
    queue: &QueueClient,
    dedup: Arc<dyn CacheStore>,
    handler: H,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
) {
    info!(
        queue = %config.queue_name,
        dlq = %config.dlq_name,
        prefetch = config.prefetch,
        retry_max = config.retry_max,
        "Consumer configuration loaded"
    );

    let name = handler.name().to_string();
    let consumer = ResilientConsumer::new(queue.clone(), dedup, Arc::new(handler), config);
    consumers.spawn(async move {
        let result = consumer.run(shutdown).await.map_err(|e| eyre::eyre!("{}", e));
        (name, result)
    });
}

/// Spawn the listing consumer for domain `D`.
fn spawn_listing<D: ListingDomain>(
    consumers: &mut JoinSet<(String, Result<()>)>,
    queue: &QueueClient,
    store: Arc<dyn CacheStore>,
    source: Arc<dyn ChunkSource<D>>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listing = ListingConfig::from_env_with_defaults(D::ENV_PREFIX, D::default_config())
        .wrap_err_with(|| format!("Failed to load {} listing configuration", D::NAME))?;
    let consumer_config = ConsumerConfig::from_env_for::<D>()
        .wrap_err_with(|| format!("Failed to load {} consumer configuration", D::NAME))?;

    let processor = ListingProcessor::<D>::new(store.clone(), &listing, source);
    spawn_consumer(consumers, queue, store, processor, consumer_config, shutdown);
    Ok(())
}

fn with_queue<Q: QueueDef>(state: HealthState) -> HealthState {
    state.with_queue(Q::QUEUE_NAME, Q::DLQ_NAME)
}

/// Run the jobs worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to Redis for the queues, the job cache and confirmations
/// 3. Starts one consumer per listing domain plus the notification dispatcher
/// 4. Waits for a shutdown signal and lets every consumer drain
///
/// # Errors
///
/// Returns an error if:
/// - Any configuration is missing or invalid
/// - Redis connection fails
/// - A consumer stops with a fatal error
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();

    info!(name = %app_info.name, version = %app_info.version, "Starting jobs worker service");
    info!("Environment: {:?}", environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let redis = cache_store::connect_from_config_with_retry(&redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    info!(
        consumer_group = %broker_config.consumer_group,
        consumer_id = %broker_config.consumer_id,
        "Broker configuration loaded"
    );
    let broker = Arc::new(RedisStreamBroker::new(redis.clone(), broker_config));
    let queue = QueueClient::new(broker.clone());
    let store: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::new(redis.clone()));

    let source = HttpChunkSource::new(HttpSourceConfig::from_env().wrap_err("Failed to load core API configuration")?)
        .wrap_err("Failed to build core API client")?;
    let source = Arc::new(source);

    let confirmation_config =
        DeliveryConfirmationConfig::from_env().wrap_err("Failed to load delivery confirmation configuration")?;
    let confirmations = DeliveryConfirmationStore::new(store.clone(), confirmation_config.ttl);
    let sink = HttpNotificationSink::new(HttpSinkConfig::from_env().wrap_err("Failed to load sink configuration")?)
        .wrap_err("Failed to build notification sink")?;
    let dispatcher = NotificationDispatcher::new(
        Arc::new(sink),
        Arc::new(RedisRealtimePublisher::new(redis.clone())),
        confirmations.clone(),
        confirmation_config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let mut consumers = JoinSet::new();
    spawn_listing::<CompanyList>(&mut consumers, &queue, store.clone(), source.clone(), shutdown_rx.clone())?;
    spawn_listing::<InviteList>(&mut consumers, &queue, store.clone(), source.clone(), shutdown_rx.clone())?;
    spawn_listing::<FriendshipList>(&mut consumers, &queue, store.clone(), source.clone(), shutdown_rx.clone())?;
    spawn_listing::<NotificationList>(&mut consumers, &queue, store.clone(), source.clone(), shutdown_rx.clone())?;
    spawn_listing::<UserSearch>(&mut consumers, &queue, store.clone(), source.clone(), shutdown_rx.clone())?;
    spawn_listing::<InviteBulk>(&mut consumers, &queue, store.clone(), source, shutdown_rx.clone())?;

    let notification_config = ConsumerConfig::from_env_for::<NotificationQueue>()
        .wrap_err("Failed to load notification consumer configuration")?;
    spawn_consumer(
        &mut consumers,
        &queue,
        store.clone(),
        dispatcher,
        notification_config,
        shutdown_rx.clone(),
    );

    tokio::spawn(sweep_pending_deliveries(
        confirmations,
        settings.cleanup_interval,
        shutdown_rx,
    ));

    let health_state = [
        with_queue::<CompanyList>,
        with_queue::<InviteList>,
        with_queue::<FriendshipList>,
        with_queue::<NotificationList>,
        with_queue::<UserSearch>,
        with_queue::<InviteBulk>,
        with_queue::<NotificationQueue>,
    ]
    .into_iter()
    .fold(HealthState::new(broker, app_info.name, app_info.version), |state, add| add(state));

    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut failure = None;
    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(handler = %name, "Consumer stopped"),
            Ok((name, Err(e))) => {
                error!(handler = %name, error = %e, "Consumer failed");
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "Consumer task panicked");
                failure.get_or_insert_with(|| eyre::eyre!("consumer task panicked: {}", e));
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    info!("Jobs worker service stopped");
    Ok(())
}

/// Drop pending deliveries that outlived their TTL without expiring.
async fn sweep_pending_deliveries(
    confirmations: DeliveryConfirmationStore,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match confirmations.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Removed stale pending deliveries"),
                    Err(e) => warn!(error = %e, "Pending delivery sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        temp_env::with_vars(
            [
                ("JOBS_WORKER_HEALTH_PORT", None::<&str>),
                ("HEALTH_PORT", None),
                ("DELIVERY_CLEANUP_INTERVAL_SECONDS", None),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.health_port, 8083);
                assert_eq!(settings.cleanup_interval, Duration::from_secs(300));
            },
        );
    }

    #[test]
    fn test_worker_port_wins_over_generic_port() {
        temp_env::with_vars(
            [("JOBS_WORKER_HEALTH_PORT", Some("9100")), ("HEALTH_PORT", Some("9200"))],
            || assert_eq!(WorkerSettings::from_env().unwrap().health_port, 9100),
        );
        temp_env::with_vars(
            [("JOBS_WORKER_HEALTH_PORT", None), ("HEALTH_PORT", Some("9200"))],
            || assert_eq!(WorkerSettings::from_env().unwrap().health_port, 9200),
        );
    }

    #[test]
    fn test_bad_port_is_rejected() {
        temp_env::with_var("JOBS_WORKER_HEALTH_PORT", Some("http"), || {
            assert!(matches!(
                WorkerSettings::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }

    #[test]
    fn test_health_state_lists_every_queue() {
        let broker = Arc::new(queue_worker::InMemoryBroker::new());
        let state = [with_queue::<CompanyList>, with_queue::<NotificationQueue>]
            .into_iter()
            .fold(HealthState::new(broker, "jobs-worker", "0.1.0"), |state, add| add(state));

        assert_eq!(
            state.queues,
            vec![
                ("jobs.company-list".to_string(), "jobs.company-list.dlq".to_string()),
                ("notifications.realtime".to_string(), "notifications.realtime.dlq".to_string()),
            ]
        );
    }
}
