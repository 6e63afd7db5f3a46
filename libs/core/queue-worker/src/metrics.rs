//! Prometheus metrics for queue consumers
//!
//! Provides observability into consumer throughput and failure handling.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::broker::QueueStats;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Consumer metrics helper, labelled by queue and handler
#[derive(Clone)]
pub struct ConsumerMetrics {
    queue: String,
    handler: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "queue_worker_messages_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a message processed and acknowledged
    pub fn message_acked(&self, duration: Duration) {
        counter!(
            "queue_worker_messages_acked_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);

        histogram!(
            "queue_worker_processing_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a duplicate skipped by the dedup guard
    pub fn message_skipped(&self) {
        counter!(
            "queue_worker_messages_skipped_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a processing failure
    pub fn message_failed(&self, category: &str) {
        counter!(
            "queue_worker_processing_errors_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn message_retried(&self) {
        counter!(
            "queue_worker_messages_retried_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a message sent to the DLQ
    pub fn message_dead_lettered(&self, reason: &str) {
        counter!(
            "queue_worker_messages_dead_lettered_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn in_flight_inc(&self) {
        gauge!(
            "queue_worker_in_flight",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1.0);
    }

    pub fn in_flight_dec(&self) {
        gauge!(
            "queue_worker_in_flight",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .decrement(1.0);
    }
}

/// Update depth gauges for one queue
pub fn record_queue_stats(stats: &QueueStats) {
    gauge!("queue_worker_queue_length", "queue" => stats.queue.clone()).set(stats.length as f64);
    gauge!("queue_worker_queue_pending", "queue" => stats.queue.clone()).set(stats.pending as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ConsumerMetrics::new("jobs.company-list", "company-list");
        assert_eq!(metrics.queue, "jobs.company-list");
        assert_eq!(metrics.handler, "company-list");

        // No recorder installed: recording is a no-op
        metrics.message_received();
        metrics.message_acked(Duration::from_millis(5));
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(prometheus_handle().is_some());
    }
}
