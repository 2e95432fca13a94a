//! High-level metric recording for scheduler operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the events the scheduler emits. Every method is a
//! no-op until `init_metrics()` has run, so libraries and tests can record
//! freely without owning a registry.

use super::prometheus::{
    ACTIVE_WORKERS, CAPACITY_EXCEEDED_TOTAL, JOBS_IN_PROGRESS, QUEUE_DEPTH, RETRIES_TOTAL,
    SCALING_EVENTS_TOTAL, TASKS_TOTAL, TASK_DURATION,
};
use crate::scheduler::store::QueueStats;

/// Direction of an autoscaler action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDirection {
    Up,
    Down,
}

impl ScalingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingDirection::Up => "up",
            ScalingDirection::Down => "down",
        }
    }
}

/// Metrics collector for recording taskforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use taskforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task("completed", "analysis", 1.5);
/// collector.record_retry("analysis");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task execution.
    ///
    /// # Arguments
    ///
    /// * `status` - Outcome of the execution ("completed", "failed", "dead_lettered")
    /// * `task_type` - Task type label
    /// * `duration_secs` - Execution duration in seconds
    pub fn record_task(&self, status: &str, task_type: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status, task_type]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            task_type = task_type,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a retry scheduled by the retry handler.
    pub fn record_retry(&self, task_type: &str) {
        if let Some(retries_total) = RETRIES_TOTAL.get() {
            retries_total.with_label_values(&[task_type]).inc();
        }
    }

    /// Record an autoscaler action.
    pub fn record_scaling(&self, direction: ScalingDirection) {
        if let Some(scaling_events) = SCALING_EVENTS_TOTAL.get() {
            scaling_events
                .with_label_values(&[direction.as_str()])
                .inc();
        }

        tracing::trace!(direction = direction.as_str(), "Recorded scaling metric");
    }

    /// Record that queued work found no capacity at the worker ceiling.
    pub fn record_capacity_exceeded(&self) {
        if let Some(capacity_exceeded) = CAPACITY_EXCEEDED_TOTAL.get() {
            capacity_exceeded.inc();
        }
    }

    /// Update the depth gauges of the three store collections.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["queued"])
                .set(stats.queued as f64);
            queue_depth
                .with_label_values(&["processing"])
                .set(stats.processing as f64);
            queue_depth
                .with_label_values(&["dead_letter"])
                .set(stats.dead_letter as f64);
        }

        tracing::trace!(
            queue_name = %stats.queue_name,
            queued = stats.queued,
            processing = stats.processing,
            dead_letter = stats.dead_letter,
            "Updated queue depth metric"
        );
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_task() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_task("completed", "analysis", 0.2);
        collector.record_task("failed", "validation", 3.0);
        collector.record_task("dead_lettered", "content_generation", 10.0);

        let text = export_metrics();
        assert!(text.contains("taskforge_task_duration_seconds"));
    }

    #[test]
    fn test_record_scaling_and_retry() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_scaling(ScalingDirection::Up);
        collector.record_scaling(ScalingDirection::Down);
        collector.record_retry("analysis");
        collector.record_capacity_exceeded();

        let text = export_metrics();
        assert!(text.contains("taskforge_scaling_events_total"));
        assert!(text.contains("taskforge_capacity_exceeded_total"));
    }

    #[test]
    fn test_update_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(&QueueStats {
            queue_name: "tasks".to_string(),
            queued: 4,
            processing: 2,
            dead_letter: 1,
        });
        collector.update_workers(3);
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();

        assert!(export_metrics().contains("taskforge_queue_depth"));
    }

    #[test]
    fn test_scaling_direction_labels() {
        assert_eq!(ScalingDirection::Up.as_str(), "up");
        assert_eq!(ScalingDirection::Down.as_str(), "down");
    }
}
