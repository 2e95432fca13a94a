//! Error types for taskforge operations.
//!
//! Defines the error taxonomy surfaced by the scheduler:
//! - `SchedulerError`: submission, lifecycle and terminal task failures
//! - `HandlerError`: failures reported by (or imposed on) task handlers
//!
//! Queue-store and configuration errors live next to their modules
//! (`scheduler::store::QueueError`, `scheduler::config::ConfigError`) and
//! convert into `SchedulerError`.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::config::ConfigError;
use crate::scheduler::store::QueueError;
use crate::scheduler::task::TaskType;

/// Errors produced by the scheduler.
///
/// `Scheduler::submit` returns `InvalidTask` for bad input and `Queue` when
/// the store cannot persist the task. The task failure variants are produced
/// internally and observed through logs, `Scheduler::status` and the
/// dead-letter collection.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed submission input, rejected before anything is queued.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// The handler returned an error, panicked or timed out.
    #[error("Handler failure for task {task_id} (attempt {attempt}): {source}")]
    HandlerFailure {
        task_id: Uuid,
        attempt: u32,
        #[source]
        source: HandlerError,
    },

    /// No worker can take the task and the worker ceiling is reached.
    #[error("Capacity exceeded: {active_workers}/{max_workers} workers active, task {task_id} stays queued")]
    CapacityExceeded {
        task_id: Uuid,
        active_workers: usize,
        max_workers: usize,
    },

    /// Attempts are exhausted; the task now sits in the dead-letter collection.
    #[error("Task {task_id} dead-lettered after {attempts} attempts: {last_error}")]
    DeadLettered {
        task_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors reported by task handlers.
///
/// Every variant is treated identically by the retry path.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler did not finish within the task timeout.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// No handler is registered for the task type.
    #[error("No handler registered for task type '{0}'")]
    NotRegistered(TaskType),
}

impl HandlerError {
    /// Creates a `Failed` error from any displayable value.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::InvalidTask("task type must not be empty".to_string());
        assert!(err.to_string().contains("Invalid task"));

        let id = Uuid::new_v4();
        let err = SchedulerError::CapacityExceeded {
            task_id: id,
            active_workers: 4,
            max_workers: 4,
        };
        assert!(err.to_string().contains("4/4"));
        assert!(err.to_string().contains(&id.to_string()));

        let err = SchedulerError::DeadLettered {
            task_id: id,
            attempts: 3,
            last_error: "backend unavailable".to_string(),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("backend unavailable"));

        let err = SchedulerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_handler_failure_wraps_source() {
        let err = SchedulerError::HandlerFailure {
            task_id: Uuid::new_v4(),
            attempt: 2,
            source: HandlerError::Timeout(Duration::from_millis(500)),
        };
        let text = err.to_string();
        assert!(text.contains("attempt 2"));
        assert!(text.contains("timed out"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::failed("bad payload").to_string(), "bad payload");
        assert!(HandlerError::Panicked("index out of bounds".to_string())
            .to_string()
            .contains("panicked"));
        assert!(HandlerError::NotRegistered(TaskType::Analysis)
            .to_string()
            .contains("analysis"));
    }

    #[test]
    fn test_queue_error_converts() {
        let err: SchedulerError = QueueError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, SchedulerError::Queue(_)));
        assert!(err.to_string().contains("refused"));
    }
}
