//! Durable queue store contract.
//!
//! The store holds three logical collections:
//!
//! - **Queued**: tasks ranked by [`queue_score`], lowest score dequeued first
//! - **Processing**: task id → task, for tasks held by a worker
//! - **DeadLetter**: append-only list of [`DeadLetterEntry`]
//!
//! Every operation that moves a task between collections is atomic and
//! conditional on the task being where the caller expects it, so a task is
//! always in exactly one collection (or completed and removed). Callers never
//! read-modify-write store state themselves.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::task::{Priority, Task};

/// Width of one priority band in the queue ranking.
///
/// Larger than any millisecond timestamp before the year 2286, so the
/// priority term always dominates the timestamp term.
pub const PRIORITY_BAND_WIDTH: f64 = 1.0e13;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The task id is already present in the store.
    #[error("Task {0} is already in the store")]
    DuplicateTask(Uuid),

    /// Store operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Entry of the dead-letter collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(task: Task, last_error: impl Into<String>) -> Self {
        Self {
            task,
            last_error: last_error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Counts of the three collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Tasks waiting for dispatch (including those still backing off).
    pub queued: usize,
    /// Tasks held by workers.
    pub processing: usize,
    /// Tasks quarantined after exhausting their attempts.
    pub dead_letter: usize,
}

impl QueueStats {
    /// Returns the number of tasks that are not yet finished.
    pub fn in_flight(&self) -> usize {
        self.queued + self.processing
    }

    /// Returns the total number of tasks in all collections.
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.dead_letter
    }
}

/// Lowest score of a priority band.
pub fn band_floor(priority: Priority) -> f64 {
    f64::from(priority.band()) * PRIORITY_BAND_WIDTH
}

/// Ranking score of a queued task: band floor plus the time it becomes eligible.
pub fn queue_score(priority: Priority, eligible_at: DateTime<Utc>) -> f64 {
    band_floor(priority) + eligible_at.timestamp_millis().max(0) as f64
}

/// Score range `[floor, floor + now]` holding the eligible tasks of a band.
pub fn eligible_range(priority: Priority, now: DateTime<Utc>) -> (f64, f64) {
    let floor = band_floor(priority);
    (floor, floor + now.timestamp_millis().max(0) as f64)
}

/// Score of a task as it currently stands (priority and `eligible_at`).
pub fn score_of(task: &Task) -> f64 {
    queue_score(task.priority, task.eligible_at)
}

/// Storage backend for the three task collections.
///
/// Implementations must make every method atomic with respect to the others.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Name of the queue (for stats and logs).
    fn queue_name(&self) -> &str;

    /// Inserts a new task into Queued.
    ///
    /// Fails with `QueueError::DuplicateTask` if the id is already queued or
    /// processing.
    async fn enqueue(&self, task: &Task, score: f64) -> Result<(), QueueError>;

    /// Pops the best eligible queued task into Processing.
    ///
    /// Bands are scanned from critical to low; within a band the earliest
    /// `eligible_at` wins. Tasks still backing off at `now` are skipped.
    async fn dequeue_max(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueError>;

    /// Moves a specific task from Queued to Processing.
    ///
    /// Returns `None` if the task is no longer queued.
    async fn move_to_processing(&self, task_id: Uuid) -> Result<Option<Task>, QueueError>;

    /// Removes a finished task from Processing.
    ///
    /// Returns `false` if the task was not processing.
    async fn complete(&self, task_id: Uuid) -> Result<bool, QueueError>;

    /// Moves a task from Processing back to Queued with a new score.
    ///
    /// The stored copy is replaced by `task`. Returns `false` (and changes
    /// nothing) if the task was not processing.
    async fn requeue(&self, task: &Task, score: f64) -> Result<bool, QueueError>;

    /// Moves a task from Processing to DeadLetter.
    ///
    /// Returns `false` (and changes nothing) if the task was not processing.
    async fn move_to_dead_letter(&self, task: &Task, error: &str) -> Result<bool, QueueError>;

    /// Returns the size of each collection.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Returns up to `limit` queued tasks in ranking order, without removing them.
    async fn peek_queued(&self, limit: usize) -> Result<Vec<Task>, QueueError>;

    /// Returns up to `limit` dead-letter entries, newest first.
    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Moves a dead-lettered task back to Queued with its attempts reset.
    ///
    /// Returns the re-queued task, or `None` if no entry has that id.
    async fn replay_dead_letter(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError>;

    /// Moves every Processing entry back to Queued, eligible at `now`.
    ///
    /// Used when a scheduler starts: no worker of a fresh process holds any
    /// task, so everything left in Processing belongs to a previous run.
    async fn recover_processing(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskType;

    #[test]
    fn test_priority_dominates_timestamp() {
        let now = Utc::now();
        let much_later = now + chrono::Duration::days(365 * 50);

        // A critical task eligible far in the future still ranks before a low
        // task eligible now.
        assert!(queue_score(Priority::Critical, much_later) < queue_score(Priority::Low, now));
        assert!(queue_score(Priority::High, much_later) < queue_score(Priority::Medium, now));
    }

    #[test]
    fn test_fifo_within_band() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(5);
        assert!(queue_score(Priority::Medium, earlier) < queue_score(Priority::Medium, later));
    }

    #[test]
    fn test_eligible_range() {
        let now = Utc::now();
        let (low, high) = eligible_range(Priority::High, now);
        assert_eq!(low, PRIORITY_BAND_WIDTH);

        let ready = queue_score(Priority::High, now - chrono::Duration::seconds(1));
        let backing_off = queue_score(Priority::High, now + chrono::Duration::seconds(1));
        assert!(ready >= low && ready <= high);
        assert!(backing_off > high);
    }

    #[test]
    fn test_score_of_uses_eligible_at() {
        let mut task = Task::new(TaskType::Analysis, serde_json::Value::Null, Priority::Low);
        let base = score_of(&task);
        task.eligible_at += chrono::Duration::seconds(2);
        assert_eq!(score_of(&task) - base, 2000.0);
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            queued: 10,
            processing: 5,
            dead_letter: 2,
        };

        assert_eq!(stats.in_flight(), 15);
        assert_eq!(stats.total(), 17);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let id = Uuid::new_v4();
        let err = QueueError::DuplicateTask(id);
        assert!(err.to_string().contains(&id.to_string()));

        let err = QueueError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let task = Task::new(TaskType::Validation, serde_json::Value::Null, Priority::High);
        let entry = DeadLetterEntry::new(task, "Test error message");

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&serialized).expect("should parse back");

        assert!(parsed.get("task").is_some());
        assert_eq!(parsed["last_error"], "Test error message");
        assert!(parsed.get("failed_at").is_some());
    }
}
