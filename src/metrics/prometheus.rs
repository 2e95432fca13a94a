//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by taskforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished task executions, labeled by status and task type.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks per store collection (queued, processing, dead_letter).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently being executed by workers.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of non-offline workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Total retries scheduled, labeled by task type.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total autoscaler actions, labeled by direction (up/down).
pub static SCALING_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total times queued work was found waiting at the worker ceiling.
pub static CAPACITY_EXCEEDED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first registry stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("taskforge_tasks_total", "Total number of finished task executions"),
        &["status", "task_type"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "taskforge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["task_type"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("taskforge_retries_total", "Total retries scheduled"),
        &["task_type"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("taskforge_queue_depth", "Number of tasks per store collection"),
        &["collection"],
    )?;

    let jobs_in_progress = Gauge::new(
        "taskforge_jobs_in_progress",
        "Number of tasks currently being executed",
    )?;

    let capacity_exceeded_total = Counter::new(
        "taskforge_capacity_exceeded_total",
        "Total times queued work was waiting at the worker ceiling",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("taskforge_active_workers", "Number of non-offline workers")?;

    let scaling_events_total = CounterVec::new(
        Opts::new("taskforge_scaling_events_total", "Total autoscaler actions"),
        &["direction"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(capacity_exceeded_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(scaling_events_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = CAPACITY_EXCEEDED_TOTAL.set(capacity_exceeded_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SCALING_EVENTS_TOTAL.set(scaling_events_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
///
/// Returns metrics in Prometheus text format; mount it in whatever web
/// framework the embedding application uses.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&["completed", "analysis"])
                .inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("taskforge_tasks_total"));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let _ = init_metrics();
        let body = metrics_handler().await;
        assert!(!body.is_empty());
    }
}
