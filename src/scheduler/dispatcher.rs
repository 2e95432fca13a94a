//! Scoring-based task assignment.
//!
//! For a task of type `T`, every non-offline worker capable of `T` with room
//! in its local queue is scored:
//!
//! ```text
//! score = (idle ? 100 : 0) + (bound - queue_len) * 10 + (100 - cpu_load_estimate) + completed_count
//! ```
//!
//! The highest score wins; ties go to the oldest worker. When no worker
//! qualifies, a new one capable of `T` is created unless the ceiling is
//! reached, in which case the task stays in Queued for a later dispatch pass.
//!
//! Moving the task from Queued to the chosen worker goes through one atomic
//! store move (`move_to_processing` or `dequeue_max`) while the pool lock is
//! held, so concurrent submitters and the control loop never dispatch the same
//! task twice. A new worker is only created once that move has succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::SchedulerError;

use super::store::score_of;
use super::task::{Task, TaskStatus, TaskType};
use super::worker::{WorkerSlot, WorkerStatus};
use super::worker_pool::{PendingMove, PoolState, WorkerPool};

/// Score of a worker for a new assignment.
pub fn worker_score(worker: &WorkerSlot, queue_bound: usize) -> f64 {
    let idle_bonus = if worker.status == WorkerStatus::Idle {
        100.0
    } else {
        0.0
    };
    let free_slots = queue_bound.saturating_sub(worker.queue_depth()) as f64;

    idle_bonus
        + free_slots * 10.0
        + (100.0 - worker.load.cpu_load_estimate)
        + worker.completed_count as f64
}

/// Returns the index of the best worker for a task type, if any qualifies.
pub fn select_worker(workers: &[WorkerSlot], task_type: TaskType, queue_bound: usize) -> Option<usize> {
    workers
        .iter()
        .enumerate()
        .filter(|(_, worker)| worker.accepts(task_type, queue_bound))
        .max_by(|(_, a), (_, b)| {
            worker_score(a, queue_bound)
                .total_cmp(&worker_score(b, queue_bound))
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.seq.cmp(&a.seq))
        })
        .map(|(index, _)| index)
}

/// Summary of one dispatch pass over Queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Tasks moved onto a worker.
    pub dispatched: usize,
    /// Tasks taken out of Queued but put back for lack of a capable worker.
    pub deferred: usize,
}

impl WorkerPool {
    /// Assigns a queued task to the best worker, creating one if needed.
    ///
    /// Returns the chosen worker id, or `None` if the task had already been
    /// dispatched by someone else.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::CapacityExceeded` when no worker can take the
    /// task and the ceiling is reached; the task stays in Queued.
    /// Returns `SchedulerError::NotRunning` once the pool is shutting down.
    pub async fn assign(self: &Arc<Self>, task: &Task) -> Result<Option<String>, SchedulerError> {
        let mut state = self.lock_state().await;

        let existing = select_worker(&state.workers, task.task_type, self.config.worker_queue_bound);
        if existing.is_none() {
            if state.active_count() >= self.config.max_workers {
                return Err(SchedulerError::CapacityExceeded {
                    task_id: task.id,
                    active_workers: state.active_count(),
                    max_workers: self.config.max_workers,
                });
            }
            if self.is_closed() {
                return Err(SchedulerError::NotRunning);
            }
        }

        let Some(claimed) = self.store.move_to_processing(task.id).await? else {
            debug!(task_id = %task.id, "Task already dispatched");
            return Ok(None);
        };

        let index = match existing {
            Some(index) => index,
            None => {
                let capabilities: HashSet<TaskType> = [task.task_type].into_iter().collect();
                match self.spawn_worker(&mut state, capabilities) {
                    Some(index) => index,
                    None => {
                        // Closed between the check and the claim.
                        let mut released = claimed;
                        released.status = TaskStatus::Queued;
                        if let Err(e) = self.store.requeue(&released, score_of(&released)).await {
                            error!(task_id = %released.id, error = %e, "Failed to release claimed task");
                            state.defer_move(PendingMove::Requeue(released));
                        }
                        return Err(SchedulerError::NotRunning);
                    }
                }
            }
        };

        Ok(Some(hand_over(&mut state.workers[index], claimed)))
    }

    /// Moves eligible queued tasks onto workers, best score first.
    ///
    /// Runs until Queued has nothing eligible at `now`, the pool has no room
    /// left, or `dispatch_batch` tasks have been taken. Tasks no worker can
    /// take are put back with their original score.
    pub async fn dispatch_queued(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, SchedulerError> {
        let mut state = self.lock_state().await;
        let mut report = DispatchReport::default();
        let mut deferred: Vec<Task> = Vec::new();

        let outcome = self
            .fill_workers(&mut state, now, &mut report, &mut deferred)
            .await;

        for task in deferred {
            match self.store.requeue(&task, score_of(&task)).await {
                Ok(_) => report.deferred += 1,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to put deferred task back");
                    state.defer_move(PendingMove::Requeue(task));
                }
            }
        }

        outcome.map(|()| report)
    }

    async fn fill_workers(
        self: &Arc<Self>,
        state: &mut PoolState,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
        deferred: &mut Vec<Task>,
    ) -> Result<(), SchedulerError> {
        for _ in 0..self.config.dispatch_batch {
            if !self.has_room(state) {
                break;
            }
            let Some(mut task) = self.store.dequeue_max(now).await? else {
                break;
            };

            match self.place_or_spawn(state, task.task_type) {
                Some(index) => {
                    let worker_id = hand_over(&mut state.workers[index], task);
                    debug!(worker_id = %worker_id, "Dispatched queued task");
                    report.dispatched += 1;
                }
                None => {
                    task.status = TaskStatus::Queued;
                    deferred.push(task);
                }
            }
        }
        Ok(())
    }

    /// Picks the best worker for a task type, creating one below the ceiling.
    fn place_or_spawn(self: &Arc<Self>, state: &mut PoolState, task_type: TaskType) -> Option<usize> {
        if let Some(index) = select_worker(&state.workers, task_type, self.config.worker_queue_bound) {
            return Some(index);
        }
        if state.active_count() >= self.config.max_workers {
            return None;
        }
        let capabilities: HashSet<TaskType> = [task_type].into_iter().collect();
        self.spawn_worker(state, capabilities)
    }

    /// Returns whether any task could still be placed.
    fn has_room(&self, state: &PoolState) -> bool {
        state.active_count() < self.config.max_workers
            || state
                .workers
                .iter()
                .any(|worker| worker.is_active() && worker.has_capacity(self.config.worker_queue_bound))
    }
}

/// Appends a claimed task to a worker's local queue and wakes the worker.
fn hand_over(worker: &mut WorkerSlot, mut task: Task) -> String {
    task.status = TaskStatus::Processing;
    task.assigned_worker_id = Some(worker.id.clone());
    debug!(
        worker_id = %worker.id,
        task_id = %task.id,
        queue_depth = worker.queue_depth() + 1,
        "Assigned task to worker"
    );
    worker.local_queue.push_back(task);
    worker.notify.notify_one();
    worker.id.clone()
}
