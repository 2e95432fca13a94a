//! Worker pool: the registry of worker slots and their execution loops.
//!
//! Each worker runs as an independent async task that pulls from its own
//! bounded local queue, one task at a time. Tasks reach the local queues
//! through the dispatcher (`dispatcher.rs`); the health monitor and the
//! autoscaler mutate the same registry from the control loop.
//!
//! # Features
//!
//! - Workers created on demand, up to the configured ceiling
//! - Handler execution in a separate task: bounded by a timeout, panics
//!   caught, abortable when the worker is reclaimed
//! - Retry and dead-lettering through [`RetryHandler`]
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, SchedulerError};
use crate::metrics::MetricsCollector;

use super::config::SchedulerConfig;
use super::handler::HandlerRegistry;
use super::retry::{FailureDisposition, RetryHandler, RetryPolicy};
use super::store::{score_of, QueueError, QueueStore};
use super::task::{Task, TaskOutcome, TaskStatus, TaskType};
use super::worker::{InFlight, WorkerSlot, WorkerSnapshot, WorkerStatus};

type HandlerJoin = JoinHandle<Result<serde_json::Value, HandlerError>>;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Number of tasks currently executing.
    pub executing: u64,
    /// Total number of successful executions.
    pub tasks_completed: u64,
    /// Total number of failed executions (retried or dead-lettered).
    pub tasks_failed: u64,
    /// Total number of tasks moved to the dead-letter collection.
    pub tasks_dead_lettered: u64,
    /// Average execution duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of executions (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    executing: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            executing: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_dead_letter(&self) {
        self.tasks_dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_executing(&self) {
        self.executing.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_executing(&self) {
        self.executing.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            executing: self.executing.load(Ordering::SeqCst),
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::SeqCst),
            average_task_duration: average_duration,
        }
    }
}

/// A store write that failed and is tried again on the next health sweep.
///
/// Until it succeeds the task sits in Processing with no worker holding it.
#[derive(Debug, Clone)]
pub(crate) enum PendingMove {
    Complete(Uuid),
    Requeue(Task),
    DeadLetter { task: Task, error: String },
}

impl PendingMove {
    /// The move a failed retry decision was trying to make.
    fn after_failure(task: Task) -> Self {
        if task.status == TaskStatus::Failed {
            let error = task.error.clone().unwrap_or_default();
            PendingMove::DeadLetter { task, error }
        } else {
            PendingMove::Requeue(task)
        }
    }

    pub(crate) fn task_id(&self) -> Uuid {
        match self {
            PendingMove::Complete(task_id) => *task_id,
            PendingMove::Requeue(task) | PendingMove::DeadLetter { task, .. } => task.id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PendingMove::Complete(_) => "complete",
            PendingMove::Requeue(_) => "requeue",
            PendingMove::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Mutable pool state, guarded by one lock.
///
/// Every change to a worker slot or local queue happens while holding it,
/// including the store call that goes with the change. With a remote store
/// this serializes completions on store latency.
pub(crate) struct PoolState {
    pub(crate) workers: Vec<WorkerSlot>,
    next_seq: u64,
    handles: Vec<JoinHandle<()>>,
    results: VecDeque<TaskOutcome>,
    pending: Vec<PendingMove>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
            next_seq: 1,
            handles: Vec::new(),
            results: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    /// Records a failed store write for the next health sweep.
    pub(crate) fn defer_move(&mut self, pending: PendingMove) {
        warn!(
            task_id = %pending.task_id(),
            kind = pending.kind(),
            "Store write failed, will retry on next health sweep"
        );
        self.pending.push(pending);
    }

    /// Number of store writes waiting to be retried.
    pub(crate) fn pending_moves(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerSlot> {
        self.workers.iter_mut().find(|worker| worker.id == worker_id)
    }

    /// Number of workers that are not offline.
    pub(crate) fn active_count(&self) -> usize {
        self.workers.iter().filter(|worker| worker.is_active()).count()
    }
}

/// What a worker does next.
enum Step {
    Run {
        task: Task,
        join: HandlerJoin,
        started: Instant,
    },
    Wait,
    Exit,
}

/// Pool of workers sharing one queue store.
pub struct WorkerPool {
    pub(crate) config: SchedulerConfig,
    state: Mutex<PoolState>,
    pub(crate) store: Arc<dyn QueueStore>,
    handlers: HandlerRegistry,
    retry: RetryHandler,
    pub(crate) metrics: MetricsCollector,
    stats: SharedPoolStats,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Creates an empty pool. Workers are added with [`add_worker`](Self::add_worker)
    /// or on demand by the dispatcher.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn QueueStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        let policy = RetryPolicy::new(config.retry_base_delay).with_jitter(config.retry_jitter);
        let retry = RetryHandler::new(policy, Arc::clone(&store));

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: Mutex::new(PoolState::new()),
            store,
            handlers,
            retry,
            metrics: MetricsCollector::new(),
            stats: SharedPoolStats::new(),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Retries store writes that failed earlier.
    ///
    /// Returns how many went through. A move the store reports as no longer
    /// applicable counts as settled; one that fails again stays pending.
    pub(crate) async fn retry_pending_moves(&self, state: &mut PoolState) -> usize {
        let mut settled = 0;
        for pending in std::mem::take(&mut state.pending) {
            let result: Result<bool, QueueError> = match &pending {
                PendingMove::Complete(task_id) => self.store.complete(*task_id).await,
                PendingMove::Requeue(task) => self.store.requeue(task, score_of(task)).await,
                PendingMove::DeadLetter { task, error } => {
                    self.store.move_to_dead_letter(task, error).await
                }
            };

            match result {
                Ok(moved) => {
                    settled += 1;
                    if moved && matches!(pending, PendingMove::DeadLetter { .. }) {
                        self.stats.record_dead_letter();
                    }
                    info!(
                        task_id = %pending.task_id(),
                        kind = pending.kind(),
                        moved = moved,
                        "Retried store write"
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = %pending.task_id(),
                        kind = pending.kind(),
                        error = %e,
                        "Store write failed again"
                    );
                    state.pending.push(pending);
                }
            }
        }
        settled
    }

    /// Creates a worker and starts its execution loop.
    ///
    /// Returns `None` once the pool is shutting down.
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        state: &mut PoolState,
        capabilities: HashSet<TaskType>,
    ) -> Option<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let slot = WorkerSlot::new(seq, capabilities);
        let worker_id = slot.id.clone();
        let notify = Arc::clone(&slot.notify);
        info!(
            worker_id = %worker_id,
            capabilities = ?slot.snapshot().capabilities,
            "Worker created"
        );

        state.workers.push(slot);

        let pool = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            pool.run_worker(worker_id, notify, shutdown_rx).await;
        });
        state.handles.push(handle);

        Some(state.workers.len() - 1)
    }

    /// Adds a worker with the given capabilities if the ceiling allows it.
    ///
    /// Returns the new worker's id.
    pub async fn add_worker(self: &Arc<Self>, capabilities: HashSet<TaskType>) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.active_count() >= self.config.max_workers {
            return None;
        }
        let index = self.spawn_worker(&mut state, capabilities)?;
        Some(state.workers[index].id.clone())
    }

    /// Returns a snapshot of every worker, offline ones included.
    pub async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let state = self.state.lock().await;
        state.workers.iter().map(WorkerSlot::snapshot).collect()
    }

    /// Returns the number of non-offline workers.
    pub async fn active_workers(&self) -> usize {
        self.state.lock().await.active_count()
    }

    /// Returns whether the ceiling is reached and no active worker has room.
    pub async fn is_saturated(&self) -> bool {
        let state = self.state.lock().await;
        state.active_count() >= self.config.max_workers
            && !state
                .workers
                .iter()
                .any(|worker| worker.is_active() && worker.has_capacity(self.config.worker_queue_bound))
    }

    /// Returns the most recent outcomes, oldest first.
    pub async fn recent_results(&self) -> Vec<TaskOutcome> {
        self.state.lock().await.results.iter().cloned().collect()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats()
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current task and stop. After `shutdown_timeout`
    /// the remaining workers and their handlers are aborted; their tasks stay
    /// in Processing and are recovered on the next start.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.closed.store(true, Ordering::SeqCst);

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let mut handles = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.handles)
        };

        let shutdown_future = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
            }
        };

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, shutdown_future).await.is_ok() {
            let mut state = self.state.lock().await;
            self.retry_pending_moves(&mut state).await;
            if state.pending_moves() > 0 {
                warn!(
                    count = state.pending_moves(),
                    "Store writes still failing at shutdown, tasks stay in processing"
                );
            }
            info!("Worker pool shutdown complete");
            return Ok(());
        }

        for handle in &handles {
            handle.abort();
        }
        let state = self.state.lock().await;
        for worker in &state.workers {
            if let Some(flight) = &worker.in_flight {
                warn!(
                    worker_id = %worker.id,
                    task_id = %flight.task.id,
                    "Aborting handler at shutdown, task stays in processing"
                );
                flight.abort.abort();
            }
        }

        Err(SchedulerError::ShutdownTimeout(timeout))
    }

    /// Main worker loop.
    ///
    /// Runs tasks from the local queue until the worker goes offline or a
    /// shutdown signal is received. While idle the loop wakes up every
    /// heartbeat interval to refresh `last_activity_at`.
    async fn run_worker(
        self: Arc<Self>,
        worker_id: String,
        notify: Arc<Notify>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(worker_id = %worker_id, "Worker started");

        loop {
            // Check for shutdown signal (non-blocking)
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %worker_id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.next_step(&worker_id).await {
                Step::Run {
                    task,
                    join,
                    started,
                } => self.execute(&worker_id, task, join, started).await,
                Step::Wait => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = shutdown_rx.recv() => {
                            info!(worker_id = %worker_id, "Worker received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                    }
                }
                Step::Exit => break,
            }
        }

        info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Pulls the next task and starts its handler, or reports idleness.
    ///
    /// The pop and the in-flight registration happen under one lock, so a
    /// concurrent reclaim always finds the task in exactly one place.
    async fn next_step(&self, worker_id: &str) -> Step {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(slot) = state.worker_mut(worker_id) else {
            return Step::Exit;
        };
        if !slot.is_active() {
            return Step::Exit;
        }

        slot.touch(now);
        let Some(mut task) = slot.local_queue.pop_front() else {
            if slot.in_flight.is_none() {
                slot.set_status(WorkerStatus::Idle, now);
            }
            return Step::Wait;
        };

        task.status = TaskStatus::Processing;
        task.assigned_worker_id = Some(slot.id.clone());

        let task_type = task.task_type;
        let payload = task.payload.clone();
        let join: HandlerJoin = match self.handlers.get(task_type) {
            Some(handler) => tokio::spawn(async move { handler.execute(task_type, payload).await }),
            None => tokio::spawn(async move { Err(HandlerError::NotRegistered(task_type)) }),
        };

        let started = Instant::now();
        slot.in_flight = Some(InFlight {
            task: task.clone(),
            abort: join.abort_handle(),
            started_at: started,
        });
        slot.set_status(WorkerStatus::Busy, now);

        self.stats.increment_executing();
        self.metrics.inc_jobs_in_progress();

        info!(
            worker_id = %worker_id,
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            attempt = task.attempt_count + 1,
            "Processing task"
        );

        Step::Run {
            task,
            join,
            started,
        }
    }

    /// Waits for the handler within the task timeout and records the outcome.
    async fn execute(&self, worker_id: &str, task: Task, mut join: HandlerJoin, started: Instant) {
        let timeout = self.config.task_timeout;
        let outcome = match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e))),
            Ok(Err(_)) => Err(HandlerError::failed("handler was cancelled")),
            Err(_) => {
                join.abort();
                Err(HandlerError::Timeout(timeout))
            }
        };

        self.stats.decrement_executing();
        self.metrics.dec_jobs_in_progress();

        self.finish(worker_id, task, outcome, started.elapsed()).await;
    }

    async fn finish(
        &self,
        worker_id: &str,
        mut task: Task,
        outcome: Result<serde_json::Value, HandlerError>,
        duration: Duration,
    ) {
        let now = Utc::now();
        let duration_ms = duration.as_millis() as u64;
        let mut guard = self.state.lock().await;
        let PoolState {
            workers,
            results,
            pending,
            ..
        } = &mut *guard;
        let Some(slot) = workers.iter_mut().find(|worker| worker.id == worker_id) else {
            return;
        };

        // A reclaimed task has already been handed back to the store.
        if slot.current_task() != Some(task.id) {
            debug!(
                worker_id = %worker_id,
                task_id = %task.id,
                "Discarding result of reclaimed task"
            );
            return;
        }
        slot.in_flight = None;
        slot.touch(now);

        match outcome {
            Ok(value) => {
                match self.store.complete(task.id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        "Completed task was no longer in processing"
                    ),
                    Err(e) => {
                        error!(
                            worker_id = %worker_id,
                            task_id = %task.id,
                            error = %e,
                            "Failed to mark task complete"
                        );
                        pending.push(PendingMove::Complete(task.id));
                    }
                }

                slot.completed_count += 1;
                self.stats.record_completion(duration);
                self.metrics
                    .record_task("completed", task.task_type.as_str(), duration.as_secs_f64());
                info!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    duration_ms = duration_ms,
                    "Task completed successfully"
                );

                task.status = TaskStatus::Completed;
                self.push_result(results, TaskOutcome::success(&task, worker_id, value, duration_ms));
            }
            Err(failure) => {
                slot.failed_count += 1;
                self.stats.record_failure(duration);
                self.metrics
                    .record_task("failed", task.task_type.as_str(), duration.as_secs_f64());

                let report = SchedulerError::HandlerFailure {
                    task_id: task.id,
                    attempt: task.attempt_count + 1,
                    source: failure.clone(),
                };
                warn!(worker_id = %worker_id, error = %report, "Task execution failed");

                match self.retry.handle_failure(&mut task, &failure, now).await {
                    Ok(FailureDisposition::DeadLettered { attempt }) => {
                        self.stats.record_dead_letter();
                        let terminal = SchedulerError::DeadLettered {
                            task_id: task.id,
                            attempts: attempt,
                            last_error: failure.to_string(),
                        };
                        error!(worker_id = %worker_id, error = %terminal, "Task dead-lettered");
                        self.push_result(
                            results,
                            TaskOutcome::failure(&task, worker_id, failure.to_string(), duration_ms),
                        );
                    }
                    Ok(FailureDisposition::Retry { .. }) => {}
                    Ok(FailureDisposition::Superseded) => debug!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        "Failed task was already moved by someone else"
                    ),
                    Err(e) => {
                        error!(
                            worker_id = %worker_id,
                            task_id = %task.id,
                            error = %e,
                            "Failed to requeue or dead-letter task"
                        );
                        pending.push(PendingMove::after_failure(task));
                    }
                }
            }
        }

        if slot.local_queue.is_empty() {
            slot.set_status(WorkerStatus::Idle, now);
        }
    }

    fn push_result(&self, results: &mut VecDeque<TaskOutcome>, outcome: TaskOutcome) {
        let capacity = self.config.result_history;
        if capacity == 0 {
            return;
        }
        while results.len() >= capacity {
            results.pop_front();
        }
        results.push_back(outcome);
    }
}

/// Extracts the message of a panicked handler.
fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                message.to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "non-string panic payload".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::handler::{FnHandler, TaskHandler};
    use crate::scheduler::health::HealthMonitor;
    use crate::scheduler::memory_store::MemoryQueueStore;
    use crate::scheduler::task::Priority;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_worker_limits(0, 2)
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_task_timeout(Duration::from_millis(200))
            .with_retry_base_delay(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    fn pool_with(handler: Arc<dyn TaskHandler>) -> (Arc<WorkerPool>, Arc<MemoryQueueStore>) {
        let store = Arc::new(MemoryQueueStore::default());
        let handlers = HandlerRegistry::new().with_handler_for_all(handler);
        let pool = Arc::new(WorkerPool::new(test_config(), store.clone(), handlers));
        (pool, store)
    }

    /// Queues a task directly on a worker, the way the dispatcher does.
    async fn hand_to_worker(pool: &Arc<WorkerPool>, store: &MemoryQueueStore, task: &Task) {
        store.enqueue(task, score_of(task)).await.unwrap();
        let claimed = store.move_to_processing(task.id).await.unwrap().unwrap();
        let mut state = pool.lock_state().await;
        let index = match state.workers.first() {
            Some(_) => 0,
            None => pool
                .spawn_worker(&mut state, TaskType::ALL.into_iter().collect())
                .unwrap(),
        };
        state.workers[index].local_queue.push_back(claimed);
        state.workers[index].notify.notify_one();
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> futures::future::BoxFuture<'static, bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_successful_execution_completes_task() {
        let handler = Arc::new(FnHandler::new(|_task_type, payload| async move {
            Ok::<_, HandlerError>(serde_json::json!({"echo": payload}))
        }));
        let (pool, store) = pool_with(handler);

        let task = Task::new(TaskType::Analysis, serde_json::json!(1), Priority::High);
        hand_to_worker(&pool, &store, &task).await;

        let probe = pool.clone();
        wait_for(move || {
            let probe = probe.clone();
            Box::pin(async move { probe.stats().tasks_completed == 1 })
        })
        .await;

        assert!(!store.is_processing(task.id).await);
        let results = pool.recent_results().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert_eq!(results[0].result.as_ref().unwrap()["echo"], 1);

        let snapshots = pool.snapshots().await;
        assert_eq!(snapshots[0].completed_count, 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let handler = Arc::new(FnHandler::new(|_task_type, _payload| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<_, HandlerError>(serde_json::Value::Null)
        }));
        let (pool, store) = pool_with(handler);

        let task = Task::new(TaskType::Validation, serde_json::Value::Null, Priority::Low)
            .with_max_attempts(2);
        hand_to_worker(&pool, &store, &task).await;

        let probe = pool.clone();
        wait_for(move || {
            let probe = probe.clone();
            Box::pin(async move { probe.stats().tasks_failed == 1 })
        })
        .await;

        // Back in Queued with one attempt recorded; the worker loop survived.
        assert!(store.is_queued(task.id).await);
        let queued = store.peek_queued(1).await.unwrap();
        assert_eq!(queued[0].attempt_count, 1);
        assert!(queued[0].error.as_deref().unwrap().contains("handler blew up"));
        assert_eq!(pool.active_workers().await, 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_dead_letters_last_attempt() {
        let handler = Arc::new(FnHandler::new(|_task_type, _payload| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, HandlerError>(serde_json::Value::Null)
        }));
        let (pool, store) = pool_with(handler);

        let task = Task::new(TaskType::Analysis, serde_json::Value::Null, Priority::Medium)
            .with_max_attempts(1);
        hand_to_worker(&pool, &store, &task).await;

        let probe = store.clone();
        let id = task.id;
        wait_for(move || {
            let probe = probe.clone();
            Box::pin(async move { probe.is_dead_lettered(id).await })
        })
        .await;

        let entries = store.peek_dead_letter(1).await.unwrap();
        assert!(entries[0].last_error.contains("timed out"));
        assert_eq!(pool.stats().tasks_dead_lettered, 1);

        let results = pool.recent_results().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_worker_task_is_reclaimed_once_and_completed_elsewhere() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Arc::new(FnHandler::new(move |_task_type, payload| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, HandlerError>(payload)
            }
        }));
        let (pool, store) = pool_with(handler);

        let task = Task::new(TaskType::Analysis, serde_json::json!(7), Priority::Medium);
        hand_to_worker(&pool, &store, &task).await;

        let probe = pool.clone();
        wait_for(move || {
            let probe = probe.clone();
            Box::pin(async move { probe.stats().executing == 1 })
        })
        .await;

        // The worker loop dies mid-task and stops reporting activity.
        pool.lock_state().await.handles[0].abort();

        let monitor =
            HealthMonitor::new(&test_config().with_stale_threshold(Duration::from_millis(300)));
        let later = Utc::now() + chrono::Duration::seconds(1);

        let first = pool.health_sweep(&monitor, later).await;
        assert_eq!(first.marked_offline, vec!["worker-1".to_string()]);
        assert_eq!(first.reclaimed, 1);

        // Sweeping again before any dispatch must not queue the task twice.
        let second = pool.health_sweep(&monitor, later).await;
        assert!(second.marked_offline.is_empty());
        assert_eq!(second.reclaimed, 0);
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.queued, stats.processing), (1, 0));
        assert_eq!(store.peek_queued(10).await.unwrap().len(), 1);

        let report = pool.dispatch_queued(later).await.unwrap();
        assert_eq!(report.dispatched, 1);

        let probe = pool.clone();
        wait_for(move || {
            let probe = probe.clone();
            Box::pin(async move { probe.stats().tasks_completed == 1 })
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats().await.unwrap().total(), 0);
        let snapshots = pool.snapshots().await;
        assert_eq!(snapshots[0].status, WorkerStatus::Offline);
        assert_eq!(snapshots[0].completed_count, 0);
        assert_eq!(snapshots[1].id, "worker-2");
        assert_eq!(snapshots[1].completed_count, 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_worker_respects_ceiling() {
        let handler = Arc::new(FnHandler::new(|_task_type, _payload| async move {
            Ok::<_, HandlerError>(serde_json::Value::Null)
        }));
        let (pool, _store) = pool_with(handler);

        let caps: HashSet<TaskType> = [TaskType::Analysis].into_iter().collect();
        assert_eq!(pool.add_worker(caps.clone()).await.as_deref(), Some("worker-1"));
        assert_eq!(pool.add_worker(caps.clone()).await.as_deref(), Some("worker-2"));
        assert!(pool.add_worker(caps).await.is_none());
        assert_eq!(pool.active_workers().await, 2);

        pool.shutdown().await.unwrap();
        assert!(pool.add_worker(HashSet::new()).await.is_none());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            executing: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            tasks_dead_lettered: 3,
            average_task_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.increment_executing();

        let pool_stats = stats.to_pool_stats();

        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 1);
        assert_eq!(pool_stats.executing, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_task_duration.as_millis() > 11000);
        assert!(pool_stats.average_task_duration.as_millis() < 12000);
    }
}
