//! Worker slots.
//!
//! A `WorkerSlot` is the pool's record of one execution slot: its status,
//! bounded local queue, capabilities and counters. The slot's execution loop
//! lives in `worker_pool`; everything here is plain data guarded by the pool
//! lock.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::task::{Task, TaskType};

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Overloaded,
    /// Stale or retired. Offline workers are kept for audit and never
    /// receive new tasks.
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Overloaded => write!(f, "overloaded"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Synthetic load estimate of a worker.
///
/// Derived from queue depth and history only; used for scoring and
/// rebalancing, never for correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadMetrics {
    /// Estimated CPU load, 0-100.
    pub cpu_load_estimate: f64,
    /// Estimated resident memory in megabytes.
    pub memory_estimate_mb: f64,
}

impl LoadMetrics {
    /// Computes the load estimate.
    ///
    /// - `cpu = 80 * depth / bound + (busy ? 20 : 0)`, clamped to 0-100
    /// - `memory = 32 + 8 * depth + ln(1 + completed)` MB
    ///
    /// A worker with a full queue and a running task sits at 100.
    pub fn estimate(queue_depth: usize, queue_bound: usize, busy: bool, completed: u64) -> Self {
        let fill = if queue_bound == 0 {
            1.0
        } else {
            queue_depth as f64 / queue_bound as f64
        };
        let cpu = fill * 80.0 + if busy { 20.0 } else { 0.0 };
        let memory = 32.0 + 8.0 * queue_depth as f64 + (completed as f64).ln_1p();

        Self {
            cpu_load_estimate: cpu.clamp(0.0, 100.0),
            memory_estimate_mb: memory,
        }
    }
}

/// Task currently executing on a worker.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub task: Task,
    pub abort: AbortHandle,
    pub started_at: Instant,
}

/// The pool's record of one worker.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: String,
    /// Creation sequence number, the final tie-breaker in scoring.
    pub seq: u64,
    pub status: WorkerStatus,
    pub capabilities: HashSet<TaskType>,
    /// Tasks assigned but not yet started, in FIFO order. Every entry is in
    /// the store's Processing collection.
    pub local_queue: VecDeque<Task>,
    pub(crate) in_flight: Option<InFlight>,
    /// Successful executions.
    pub completed_count: u64,
    /// Failed executions (each one went through the retry path).
    pub failed_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// When the worker last became idle, `None` while it has work.
    pub idle_since: Option<DateTime<Utc>>,
    pub load: LoadMetrics,
    pub(crate) notify: Arc<Notify>,
}

impl WorkerSlot {
    /// Creates an idle worker.
    pub fn new(seq: u64, capabilities: HashSet<TaskType>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("worker-{}", seq),
            seq,
            status: WorkerStatus::Idle,
            capabilities,
            local_queue: VecDeque::new(),
            in_flight: None,
            completed_count: 0,
            failed_count: 0,
            created_at: now,
            last_activity_at: now,
            idle_since: Some(now),
            load: LoadMetrics::default(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != WorkerStatus::Offline
    }

    pub fn can_run(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }

    pub fn queue_depth(&self) -> usize {
        self.local_queue.len()
    }

    pub fn has_capacity(&self, queue_bound: usize) -> bool {
        self.local_queue.len() < queue_bound
    }

    /// Returns whether the dispatcher may assign a task of this type.
    pub fn accepts(&self, task_type: TaskType, queue_bound: usize) -> bool {
        self.is_active() && self.can_run(task_type) && self.has_capacity(queue_bound)
    }

    /// Returns whether the worker has nothing queued and nothing running.
    pub fn is_drained(&self) -> bool {
        self.local_queue.is_empty() && self.in_flight.is_none()
    }

    /// Id of the task currently executing.
    pub fn current_task(&self) -> Option<Uuid> {
        self.in_flight.as_ref().map(|flight| flight.task.id)
    }

    /// How long the current task has been executing.
    pub fn running_for(&self) -> Option<Duration> {
        self.in_flight.as_ref().map(|flight| flight.started_at.elapsed())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Sets the status, tracking when the worker became idle.
    ///
    /// Offline is terminal and is never left.
    pub fn set_status(&mut self, status: WorkerStatus, now: DateTime<Utc>) {
        if self.status == WorkerStatus::Offline {
            return;
        }
        match status {
            WorkerStatus::Idle => {
                if self.status != WorkerStatus::Idle || self.idle_since.is_none() {
                    self.idle_since = Some(now);
                }
            }
            _ => self.idle_since = None,
        }
        self.status = status;
    }

    /// Marks the worker offline and hands back every task it still holds.
    ///
    /// The running handler, if any, is aborted. Calling this again returns
    /// nothing, because the first call drained the slot.
    pub fn take_offline(&mut self) -> Vec<Task> {
        self.status = WorkerStatus::Offline;
        self.idle_since = None;

        let mut reclaimed: Vec<Task> = Vec::with_capacity(self.local_queue.len() + 1);
        if let Some(flight) = self.in_flight.take() {
            flight.abort.abort();
            reclaimed.push(flight.task);
        }
        reclaimed.extend(self.local_queue.drain(..));
        self.notify.notify_one();
        reclaimed
    }

    /// Recomputes the load estimate and moves between busy/idle and overloaded.
    pub fn refresh_load(&mut self, queue_bound: usize, overload_threshold: f64, now: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }

        let busy = self.in_flight.is_some();
        self.load = LoadMetrics::estimate(
            self.local_queue.len(),
            queue_bound,
            busy,
            self.completed_count,
        );

        if self.load.cpu_load_estimate > overload_threshold {
            self.set_status(WorkerStatus::Overloaded, now);
        } else if self.status == WorkerStatus::Overloaded {
            let settled = if busy || !self.local_queue.is_empty() {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
            self.set_status(settled, now);
        }
    }

    /// Returns a serializable view of the worker.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let mut capabilities: Vec<TaskType> = self.capabilities.iter().copied().collect();
        capabilities.sort();

        WorkerSnapshot {
            id: self.id.clone(),
            status: self.status,
            queue_depth: self.local_queue.len(),
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            capabilities,
            current_task: self.current_task(),
            running_for_ms: self.running_for().map(|elapsed| elapsed.as_millis() as u64),
            load: self.load,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Point-in-time view of a worker, as reported by `Scheduler::status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: WorkerStatus,
    pub queue_depth: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub capabilities: Vec<TaskType>,
    pub current_task: Option<Uuid>,
    /// Milliseconds the current task has been executing.
    pub running_for_ms: Option<u64>,
    pub load: LoadMetrics,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::Priority;

    fn slot(caps: &[TaskType]) -> WorkerSlot {
        WorkerSlot::new(1, caps.iter().copied().collect())
    }

    fn task(task_type: TaskType) -> Task {
        Task::new(task_type, serde_json::Value::Null, Priority::Medium)
    }

    #[test]
    fn test_load_estimate() {
        let empty = LoadMetrics::estimate(0, 10, false, 0);
        assert_eq!(empty.cpu_load_estimate, 0.0);
        assert_eq!(empty.memory_estimate_mb, 32.0);

        let half = LoadMetrics::estimate(5, 10, false, 0);
        assert_eq!(half.cpu_load_estimate, 40.0);

        let full = LoadMetrics::estimate(10, 10, true, 100);
        assert_eq!(full.cpu_load_estimate, 100.0);
        assert!(full.memory_estimate_mb > 32.0 + 80.0);
    }

    #[test]
    fn test_accepts() {
        let mut worker = slot(&[TaskType::Analysis]);
        assert!(worker.accepts(TaskType::Analysis, 1));
        assert!(!worker.accepts(TaskType::Validation, 1));

        worker.local_queue.push_back(task(TaskType::Analysis));
        assert!(!worker.accepts(TaskType::Analysis, 1));
        assert!(worker.accepts(TaskType::Analysis, 2));

        worker.take_offline();
        assert!(!worker.accepts(TaskType::Analysis, 2));
    }

    #[test]
    fn test_idle_since_tracking() {
        let mut worker = slot(&[TaskType::Analysis]);
        assert!(worker.idle_since.is_some());

        let now = Utc::now();
        worker.set_status(WorkerStatus::Busy, now);
        assert!(worker.idle_since.is_none());

        worker.set_status(WorkerStatus::Idle, now);
        assert_eq!(worker.idle_since, Some(now));

        // Staying idle keeps the original timestamp.
        let later = now + chrono::Duration::seconds(3);
        worker.set_status(WorkerStatus::Idle, later);
        assert_eq!(worker.idle_since, Some(now));
    }

    #[test]
    fn test_take_offline_is_idempotent() {
        let mut worker = slot(&[TaskType::Validation]);
        worker.local_queue.push_back(task(TaskType::Validation));
        worker.local_queue.push_back(task(TaskType::Validation));

        let reclaimed = worker.take_offline();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(worker.status, WorkerStatus::Offline);

        assert!(worker.take_offline().is_empty());

        // Offline is terminal.
        worker.set_status(WorkerStatus::Idle, Utc::now());
        assert_eq!(worker.status, WorkerStatus::Offline);
    }

    #[test]
    fn test_refresh_load_overload_transitions() {
        let mut worker = slot(&[TaskType::Analysis]);
        for _ in 0..10 {
            worker.local_queue.push_back(task(TaskType::Analysis));
        }

        let now = Utc::now();
        worker.refresh_load(10, 70.0, now);
        assert_eq!(worker.status, WorkerStatus::Overloaded);

        worker.local_queue.truncate(2);
        worker.refresh_load(10, 70.0, now);
        assert_eq!(worker.status, WorkerStatus::Busy);

        worker.local_queue.clear();
        worker.refresh_load(10, 70.0, now);
        assert_eq!(worker.status, WorkerStatus::Busy);
        worker.set_status(WorkerStatus::Idle, now);
        worker.refresh_load(10, 70.0, now);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_snapshot() {
        let mut worker = slot(&[TaskType::Validation, TaskType::Analysis]);
        worker.completed_count = 4;
        worker.local_queue.push_back(task(TaskType::Analysis));

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.id, "worker-1");
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.completed_count, 4);
        assert_eq!(
            snapshot.capabilities,
            vec![TaskType::Validation, TaskType::Analysis]
        );

        assert!(snapshot.running_for_ms.is_none());

        let json = serde_json::to_value(&snapshot).expect("snapshot serializes");
        assert_eq!(json["status"], "idle");
    }

    #[tokio::test]
    async fn test_snapshot_reports_running_time() {
        let mut worker = slot(&[TaskType::Analysis]);
        let handle = tokio::spawn(std::future::pending::<()>());
        let running = task(TaskType::Analysis);
        worker.in_flight = Some(InFlight {
            task: running.clone(),
            abort: handle.abort_handle(),
            started_at: Instant::now() - Duration::from_millis(250),
        });

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.current_task, Some(running.id));
        assert!(snapshot.running_for_ms.unwrap() >= 250);

        let reclaimed = worker.take_offline();
        assert_eq!(reclaimed.len(), 1);
        assert!(worker.snapshot().running_for_ms.is_none());
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
