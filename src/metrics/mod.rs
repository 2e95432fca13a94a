//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for scheduler
//! operations: task outcomes, retries, queue depth, workers and scaling.
//!
//! # Example
//!
//! ```ignore
//! use taskforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Create a collector for recording metrics
//! let collector = MetricsCollector::new();
//! collector.record_task("completed", "analysis", 0.8);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::{MetricsCollector, ScalingDirection};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, CAPACITY_EXCEEDED_TOTAL, JOBS_IN_PROGRESS, QUEUE_DEPTH, REGISTRY,
    RETRIES_TOTAL, SCALING_EVENTS_TOTAL, TASKS_TOTAL, TASK_DURATION,
};
