//! Health check handlers for queue workers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue monitoring (`/queues`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::broker::{QueueBroker, QueueStats};
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub broker: Arc<dyn QueueBroker>,
    pub app_name: String,
    pub app_version: String,
    /// `(queue, dlq)` pairs reported by `/queues`.
    pub queues: Vec<(String, String)>,
}

impl HealthState {
    pub fn new(broker: Arc<dyn QueueBroker>, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            broker,
            app_name: app_name.into(),
            app_version: app_version.into(),
            queues: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>, dlq: impl Into<String>) -> Self {
        self.queues.push((queue.into(), dlq.into()));
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Depth of a queue and its DLQ.
#[derive(Debug, Serialize)]
pub struct QueueReport {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub dlq: QueueStats,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready when the broker answers a ping.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.broker.ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": "ok" }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue depth handler for monitoring. Also refreshes the depth gauges.
pub async fn queues_handler(
    State(state): State<HealthState>,
) -> Result<Json<Vec<QueueReport>>, (StatusCode, Json<Value>)> {
    let mut reports = Vec::with_capacity(state.queues.len());

    for (queue, dlq) in &state.queues {
        let report = async {
            Ok::<_, crate::error::QueueError>(QueueReport {
                queue: state.broker.stats(queue).await?,
                dlq: state.broker.stats(dlq).await?,
            })
        }
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("Failed to read queue stats: {}", e) })),
            )
        })?;

        metrics::record_queue_stats(&report.queue);
        metrics::record_queue_stats(&report.dlq);
        reports.push(report);
    }

    Ok(Json(reports))
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the standard health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queues", get(queues_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
