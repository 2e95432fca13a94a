//! The scheduler service.
//!
//! `Scheduler` owns the worker pool, the queue store handle and the control
//! loop. It is cheap to clone; every clone drives the same scheduler.
//!
//! Each control cycle runs, in order:
//!
//! 1. the health sweep (stale workers, reclaim, load refresh, rebalance)
//! 2. the autoscaler
//! 3. a dispatch pass over eligible queued tasks
//! 4. the backlog check: queued tasks older than `backlog_alert_after` while
//!    the pool is saturated raise a warning (they are never dropped)
//! 5. gauge updates

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;

use super::autoscaler::{Autoscaler, ScalingDecision};
use super::config::{ConfigError, SchedulerConfig};
use super::dispatcher::DispatchReport;
use super::handler::HandlerRegistry;
use super::health::{HealthMonitor, HealthReport};
use super::redis_store::RedisQueueStore;
use super::store::{score_of, QueueStats, QueueStore};
use super::task::{TaskOutcome, TaskRequest, TaskType};
use super::worker::WorkerSnapshot;
use super::worker_pool::{PoolStats, WorkerPool};

/// Scheduler status as reported by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Every worker ever created, offline ones included.
    pub total_workers: usize,
    /// Workers that are not offline.
    pub active_workers: usize,
    pub queued_count: usize,
    pub processing_count: usize,
    pub dead_letter_count: usize,
    pub per_worker: Vec<WorkerSnapshot>,
    pub pool: PoolStats,
    pub running: bool,
}

/// Summary of one control cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ControlReport {
    pub health: HealthReport,
    pub scaling: ScalingDecision,
    pub dispatch: DispatchReport,
    /// Queued tasks waiting past `backlog_alert_after` at the ceiling.
    pub stalled_backlog: usize,
    pub stats: QueueStats,
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<dyn QueueStore>,
    pool: Arc<WorkerPool>,
    autoscaler: Mutex<Autoscaler>,
    health: HealthMonitor,
    metrics: MetricsCollector,
    is_running: AtomicBool,
    control_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Task scheduler: submission, workers, control loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler over an existing store.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` if the configuration is invalid or no
    /// handler is registered.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn QueueStore>,
        handlers: HandlerRegistry,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        if handlers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one task handler must be registered".to_string(),
            )
            .into());
        }

        let pool = Arc::new(WorkerPool::new(config.clone(), Arc::clone(&store), handlers));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                autoscaler: Mutex::new(Autoscaler::new(&config)),
                health: HealthMonitor::new(&config),
                config,
                store,
                pool,
                metrics: MetricsCollector::new(),
                is_running: AtomicBool::new(false),
                control_handle: Mutex::new(None),
                shutdown_tx,
            }),
        })
    }

    /// Connects to the configured Redis instance and creates a scheduler on it.
    pub async fn connect(
        config: SchedulerConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let store = RedisQueueStore::connect(&config.redis_url, &config.queue_name).await?;
        Self::new(config, Arc::new(store), handlers)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Starts the scheduler.
    ///
    /// Recovers tasks left in Processing by a previous run, creates the floor
    /// of `min_workers` workers and starts the control loop.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the scheduler is already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self
            .inner
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        // Recover any tasks stuck in processing from previous runs
        match self.inner.store.recover_processing(Utc::now()).await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered tasks from processing");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover processing tasks");
            }
        }

        let registered: HashSet<TaskType> = self
            .inner
            .pool
            .handlers()
            .registered_types()
            .into_iter()
            .collect();
        {
            let mut state = self.inner.pool.lock_state().await;
            while state.active_count() < self.inner.config.min_workers {
                if self
                    .inner
                    .pool
                    .spawn_worker(&mut state, registered.clone())
                    .is_none()
                {
                    break;
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = inner.run_control_cycle(Utc::now()).await {
                            error!(error = %e, "Control cycle failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Control loop stopped");
        });
        *self.inner.control_handle.lock().await = Some(handle);

        info!(
            queue = %self.inner.store.queue_name(),
            min_workers = self.inner.config.min_workers,
            max_workers = self.inner.config.max_workers,
            "Scheduler started"
        );
        Ok(())
    }

    /// Submits a task and returns its id.
    ///
    /// The task is persisted in Queued and assigned to a worker right away
    /// when capacity allows; otherwise it waits for a later dispatch pass.
    /// Never waits for execution.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTask` for malformed input or a task type
    /// without a handler, and `SchedulerError::Queue` if the store cannot
    /// persist the task.
    pub async fn submit(&self, request: TaskRequest) -> Result<Uuid, SchedulerError> {
        let task = request.validate(self.inner.config.max_attempts)?;
        if !self.inner.pool.handlers().supports(task.task_type) {
            return Err(SchedulerError::InvalidTask(format!(
                "no handler registered for task type '{}'",
                task.task_type
            )));
        }

        self.inner.store.enqueue(&task, score_of(&task)).await?;
        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task queued"
        );

        match self.inner.pool.assign(&task).await {
            Ok(Some(worker_id)) => {
                debug!(task_id = %task.id, worker_id = %worker_id, "Task assigned");
            }
            Ok(None) => {}
            Err(e @ SchedulerError::CapacityExceeded { .. }) => {
                self.inner.metrics.record_capacity_exceeded();
                info!(error = %e, "No worker available");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Assignment failed, task stays queued");
            }
        }

        Ok(task.id)
    }

    /// Returns worker and queue counts.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        // Hold the pool lock so worker counters and store counts agree.
        let state = self.inner.pool.lock_state().await;
        let per_worker: Vec<WorkerSnapshot> =
            state.workers.iter().map(|worker| worker.snapshot()).collect();
        let active_workers = state.active_count();
        let stats = self.inner.store.stats().await?;
        drop(state);

        Ok(SchedulerStatus {
            total_workers: per_worker.len(),
            active_workers,
            queued_count: stats.queued,
            processing_count: stats.processing,
            dead_letter_count: stats.dead_letter,
            per_worker,
            pool: self.inner.pool.stats(),
            running: self.is_running(),
        })
    }

    /// Adds a worker with the given capabilities, if the ceiling allows it.
    pub async fn add_worker(
        &self,
        capabilities: impl IntoIterator<Item = TaskType>,
    ) -> Option<String> {
        self.inner
            .pool
            .add_worker(capabilities.into_iter().collect())
            .await
    }

    /// Returns the most recent completed and dead-lettered outcomes, oldest first.
    pub async fn recent_results(&self) -> Vec<TaskOutcome> {
        self.inner.pool.recent_results().await
    }

    /// Runs one control cycle now, outside the timer.
    pub async fn run_control_cycle(&self) -> Result<ControlReport, SchedulerError> {
        self.inner.run_control_cycle(Utc::now()).await
    }

    /// Stops the control loop and the workers.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler was not started,
    /// or `SchedulerError::ShutdownTimeout` if workers don't stop in time.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");

        // Ignore send error - the control loop may have already stopped
        let _ = self.inner.shutdown_tx.send(());
        if let Some(handle) = self.inner.control_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Control loop panicked");
            }
        }

        let result = self.inner.pool.shutdown().await;
        self.inner.is_running.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!("Scheduler shutdown complete"),
            Err(e) => warn!(error = %e, "Scheduler shutdown incomplete"),
        }
        result
    }
}

impl SchedulerInner {
    async fn run_control_cycle(&self, now: DateTime<Utc>) -> Result<ControlReport, SchedulerError> {
        let health = self.pool.health_sweep(&self.health, now).await;

        let scaling = {
            let mut autoscaler = self.autoscaler.lock().await;
            self.pool.autoscale(&mut autoscaler, now).await?
        };

        let dispatch = self.pool.dispatch_queued(now).await?;
        let stalled_backlog = self.check_backlog(now).await?;

        let stats = self.store.stats().await?;
        self.metrics.update_queue_depth(&stats);
        self.metrics.update_workers(self.pool.active_workers().await);

        debug!(
            reclaimed = health.reclaimed,
            rebalanced = health.rebalanced,
            dispatched = dispatch.dispatched,
            queued = stats.queued,
            processing = stats.processing,
            "Control cycle complete"
        );

        Ok(ControlReport {
            health,
            scaling,
            dispatch,
            stalled_backlog,
            stats,
        })
    }

    /// Warns about eligible queued tasks stuck at the worker ceiling.
    async fn check_backlog(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        if !self.pool.is_saturated().await {
            return Ok(0);
        }

        let alert_after = chrono::Duration::from_std(self.config.backlog_alert_after)
            .unwrap_or(chrono::Duration::MAX);
        let head = self.store.peek_queued(self.config.dispatch_batch).await?;
        let stalled: Vec<_> = head
            .iter()
            .filter(|task| task.is_eligible(now) && now - task.created_at > alert_after)
            .collect();

        if let Some(oldest) = stalled.iter().min_by_key(|task| task.created_at) {
            self.metrics.record_capacity_exceeded();
            warn!(
                stalled = stalled.len(),
                oldest_task_id = %oldest.id,
                oldest_age_secs = (now - oldest.created_at).num_seconds(),
                max_workers = self.config.max_workers,
                "Queued tasks are waiting at the worker ceiling"
            );
        }

        Ok(stalled.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::handler::{FnHandler, HandlerError};
    use crate::scheduler::memory_store::MemoryQueueStore;
    use std::time::Duration;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new().with_handler(
            TaskType::Analysis,
            Arc::new(FnHandler::new(|_task_type, payload| async move {
                Ok::<_, HandlerError>(payload)
            })),
        )
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_worker_limits(1, 2)
            .with_tick_interval(Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let store = Arc::new(MemoryQueueStore::default());
        let bad = config().with_worker_limits(3, 1);
        assert!(matches!(
            Scheduler::new(bad, store.clone(), registry()),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            Scheduler::new(config(), store, HandlerRegistry::new()),
            Err(SchedulerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_tasks() {
        let store = Arc::new(MemoryQueueStore::default());
        let scheduler = Scheduler::new(config(), store.clone(), registry()).unwrap();

        let empty = scheduler.submit(TaskRequest::new("", serde_json::Value::Null)).await;
        assert!(matches!(empty, Err(SchedulerError::InvalidTask(_))));

        let bad_priority = scheduler
            .submit(TaskRequest::new("analysis", serde_json::Value::Null).with_priority("urgent"))
            .await;
        assert!(matches!(bad_priority, Err(SchedulerError::InvalidTask(_))));

        let unhandled = scheduler
            .submit(TaskRequest::new("validation", serde_json::Value::Null))
            .await;
        assert!(matches!(unhandled, Err(SchedulerError::InvalidTask(_))));

        // Nothing was queued.
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = Arc::new(MemoryQueueStore::default());
        let scheduler = Scheduler::new(config(), store, registry()).unwrap();

        assert!(matches!(
            scheduler.shutdown().await,
            Err(SchedulerError::NotRunning)
        ));

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.active_workers, 1);
        assert!(status.running);

        scheduler.shutdown().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_recovers_orphaned_tasks() {
        let store = Arc::new(MemoryQueueStore::default());
        let orphan = TaskRequest::new("analysis", serde_json::json!("left over"))
            .validate(3)
            .unwrap();
        store.enqueue(&orphan, score_of(&orphan)).await.unwrap();
        store.move_to_processing(orphan.id).await.unwrap();

        let scheduler = Scheduler::new(config(), store.clone(), registry()).unwrap();
        scheduler.start().await.unwrap();

        for _ in 0..100 {
            if scheduler.status().await.unwrap().pool.tasks_completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.pool.tasks_completed, 1);
        assert_eq!(status.processing_count, 0);
        assert_eq!(status.queued_count, 0);

        scheduler.shutdown().await.unwrap();
    }
}
