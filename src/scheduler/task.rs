//! Task definitions for the scheduler.
//!
//! This module defines the core task types used in the scheduling system:
//!
//! - `TaskRequest`: Raw input accepted by `Scheduler::submit`
//! - `Task`: A unit of work tracked by the queue store and executed by workers
//! - `TaskType`: The closed set of work kinds a worker can be capable of
//! - `Priority`: Dispatch priority, dominating the queue ranking
//! - `TaskOutcome`: Result of a finished execution

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Default maximum number of attempts for a task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Kind of work carried by a task.
///
/// Each variant is mapped to exactly one registered handler at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Content-generation jobs.
    ContentGeneration,
    /// Validation jobs.
    Validation,
    /// Analysis jobs.
    Analysis,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 3] = [
        TaskType::ContentGeneration,
        TaskType::Validation,
        TaskType::Analysis,
    ];

    /// Returns the canonical string form used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ContentGeneration => "content_generation",
            TaskType::Validation => "validation",
            TaskType::Analysis => "analysis",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "" => Err(SchedulerError::InvalidTask(
                "task type must not be empty".to_string(),
            )),
            "content_generation" | "generation" => Ok(TaskType::ContentGeneration),
            "validation" => Ok(TaskType::Validation),
            "analysis" => Ok(TaskType::Analysis),
            other => Err(SchedulerError::InvalidTask(format!(
                "unknown task type '{}'",
                other
            ))),
        }
    }
}

/// Dispatch priority of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Priorities from most to least urgent.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Position of the priority's band in the queue ranking (0 dequeues first).
    pub fn band(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SchedulerError::InvalidTask(format!(
                "priority must be one of low, medium, high, critical (got '{}')",
                other
            ))),
        }
    }
}

impl From<Priority> for String {
    fn from(priority: Priority) -> Self {
        priority.as_str().to_string()
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Unvalidated submission input.
///
/// Type and priority arrive as strings from the surrounding application and
/// are checked by [`TaskRequest::validate`] before anything is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: String,
    /// Overrides the scheduler's configured attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskRequest {
    /// Creates a request with medium priority.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: Priority::Medium.into(),
            max_attempts: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Parses the request into a [`Task`].
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTask` if the type is empty or unknown,
    /// the priority is not one of the four levels, or `max_attempts` is zero.
    pub fn validate(&self, default_max_attempts: u32) -> Result<Task, SchedulerError> {
        let task_type: TaskType = self.task_type.parse()?;
        let priority: Priority = self.priority.parse()?;
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(SchedulerError::InvalidTask(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(Task::new(task_type, self.payload.clone(), priority).with_max_attempts(max_attempts))
    }
}

/// A unit of work tracked by the queue store.
///
/// The store collection a task sits in (queued, processing, dead letter) is
/// authoritative; `status` mirrors the last in-process transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, immutable once created.
    pub id: Uuid,
    pub task_type: TaskType,
    /// Opaque payload handed to the handler.
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Number of failed executions so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may be dispatched (pushed back by retry backoff).
    pub eligible_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_worker_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// Creates a new queued task, eligible immediately.
    pub fn new(task_type: TaskType, payload: serde_json::Value, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            priority,
            status: TaskStatus::Queued,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            eligible_at: now,
            assigned_worker_id: None,
            result: None,
            error: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Records one more failed attempt, never past `max_attempts`.
    pub fn increment_attempts(&mut self) {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
    }

    /// Returns whether the task may run again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Returns whether the task's backoff has expired at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at <= now
    }

    /// Returns how long ago the task was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Resets the task to the queued state, detached from any worker.
    pub fn mark_queued(&mut self, eligible_at: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.assigned_worker_id = None;
        self.eligible_at = eligible_at;
    }
}

/// Result of a finished task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// `Completed` on success, `Failed` when the task was dead-lettered.
    pub status: TaskStatus,
    pub worker_id: String,
    pub attempts: u32,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    /// Creates a successful outcome.
    pub fn success(
        task: &Task,
        worker_id: impl Into<String>,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            status: TaskStatus::Completed,
            worker_id: worker_id.into(),
            attempts: task.attempt_count + 1,
            result: Some(result),
            error: None,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    /// Creates a terminal failure outcome.
    pub fn failure(
        task: &Task,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            status: TaskStatus::Failed,
            worker_id: worker_id.into(),
            attempts: task.attempt_count,
            result: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    /// Returns whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_parse() {
        assert_eq!(
            "content_generation".parse::<TaskType>().unwrap(),
            TaskType::ContentGeneration
        );
        assert_eq!(
            "Content-Generation".parse::<TaskType>().unwrap(),
            TaskType::ContentGeneration
        );
        assert_eq!("validation".parse::<TaskType>().unwrap(), TaskType::Validation);
        assert_eq!(" analysis ".parse::<TaskType>().unwrap(), TaskType::Analysis);

        let err = "".parse::<TaskType>().unwrap_err();
        assert!(err.to_string().contains("empty"));

        let err = "compile".parse::<TaskType>().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTask(_)));
    }

    #[test]
    fn test_priority_parse_and_band() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());

        assert!(Priority::Critical.band() < Priority::High.band());
        assert!(Priority::High.band() < Priority::Medium.band());
        assert!(Priority::Medium.band() < Priority::Low.band());
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_request_validate() {
        let request = TaskRequest::new("validation", serde_json::json!({"doc": 1}))
            .with_priority(Priority::High)
            .with_max_attempts(5);

        let task = request.validate(3).expect("request should be valid");
        assert_eq!(task.task_type, TaskType::Validation);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.max_attempts, 5);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.payload["doc"], 1);
    }

    #[test]
    fn test_request_validate_rejects_bad_input() {
        let empty_type = TaskRequest::new("", serde_json::Value::Null);
        assert!(matches!(
            empty_type.validate(3),
            Err(SchedulerError::InvalidTask(_))
        ));

        let bad_priority = TaskRequest::new("analysis", serde_json::Value::Null).with_priority("p0");
        assert!(matches!(
            bad_priority.validate(3),
            Err(SchedulerError::InvalidTask(_))
        ));

        let zero_attempts = TaskRequest::new("analysis", serde_json::Value::Null).with_max_attempts(0);
        assert!(zero_attempts.validate(3).is_err());
    }

    #[test]
    fn test_task_attempts() {
        let mut task =
            Task::new(TaskType::Analysis, serde_json::Value::Null, Priority::Low).with_max_attempts(2);

        assert!(task.should_retry());
        assert_eq!(task.remaining_attempts(), 2);

        task.increment_attempts();
        assert!(task.should_retry());

        task.increment_attempts();
        assert!(!task.should_retry());
        assert_eq!(task.remaining_attempts(), 0);

        // Never exceeds the bound.
        task.increment_attempts();
        assert_eq!(task.attempt_count, 2);
    }

    #[test]
    fn test_mark_queued_detaches_worker() {
        let mut task = Task::new(TaskType::Validation, serde_json::Value::Null, Priority::Medium);
        task.status = TaskStatus::Processing;
        task.assigned_worker_id = Some("worker-1".to_string());

        let later = Utc::now() + chrono::Duration::seconds(5);
        task.mark_queued(later);

        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_worker_id.is_none());
        assert!(!task.is_eligible(Utc::now()));
        assert!(task.is_eligible(later));
    }

    #[test]
    fn test_task_serialization() {
        let task = Task::new(
            TaskType::ContentGeneration,
            serde_json::json!({"prompt": "hello"}),
            Priority::Critical,
        );

        let json = serde_json::to_string(&task).expect("serialization should work");
        assert!(json.contains("\"content_generation\""));
        assert!(json.contains("\"critical\""));

        let parsed: Task = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.priority, Priority::Critical);
    }

    #[test]
    fn test_outcome_constructors() {
        let mut task = Task::new(TaskType::Analysis, serde_json::Value::Null, Priority::Low);
        let ok = TaskOutcome::success(&task, "worker-1", serde_json::json!("done"), 12);
        assert!(ok.is_success());
        assert_eq!(ok.attempts, 1);

        task.attempt_count = 3;
        let failed = TaskOutcome::failure(&task, "worker-2", "boom", 40);
        assert!(!failed.is_success());
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
