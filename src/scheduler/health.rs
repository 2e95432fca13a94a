//! Health monitor and load rebalancer.
//!
//! One sweep per control cycle:
//!
//! 0. Store writes that failed since the last sweep (completion, retry,
//!    dead-letter, reclaim) are tried again.
//! 1. Workers whose `last_activity_at` is older than the stale threshold are
//!    marked offline. Every task they hold (local queue and the running one)
//!    goes back to Queued, eligible immediately. Offline workers still
//!    holding tasks are drained the same way.
//! 2. Load estimates are recomputed; workers above the overload threshold
//!    become `Overloaded`.
//! 3. Each overloaded worker hands its tail task to an idle capable worker
//!    with spare room. The task stays in Processing throughout, so the move
//!    never duplicates it.
//!
//! Reclaiming is idempotent: a drained slot returns nothing on the next
//! sweep, and the store only requeues tasks still in Processing.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use super::store::score_of;
use super::task::Task;
use super::worker::{WorkerSlot, WorkerStatus};
use super::worker_pool::{PendingMove, WorkerPool};

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Workers marked offline in this sweep.
    pub marked_offline: Vec<String>,
    /// Tasks returned from offline workers to Queued.
    pub reclaimed: usize,
    /// Tasks moved from an overloaded worker to an idle one.
    pub rebalanced: usize,
    /// Earlier failed store writes that went through in this sweep.
    pub repaired: usize,
    /// Failed store writes still waiting after the sweep.
    pub pending_moves: usize,
    /// Workers above the overload threshold after the sweep.
    pub overloaded: usize,
}

/// Stale detection and load thresholds.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    stale_threshold: Duration,
    overload_threshold: f64,
    queue_bound: usize,
}

impl HealthMonitor {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            stale_threshold: config.stale_threshold,
            overload_threshold: config.overload_threshold,
            queue_bound: config.worker_queue_bound,
        }
    }

    /// Returns whether an active worker has stopped reporting activity.
    pub fn is_stale(&self, worker: &WorkerSlot, now: DateTime<Utc>) -> bool {
        let silent_for = (now - worker.last_activity_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        worker.is_active() && silent_for > self.stale_threshold
    }

    /// Pairs each overloaded worker with an idle worker able to take its tail task.
    ///
    /// Returns `(from, to)` index pairs; each worker appears at most once.
    pub fn plan_rebalance(&self, workers: &[WorkerSlot]) -> Vec<(usize, usize)> {
        let mut taken: HashSet<usize> = HashSet::new();
        let mut moves = Vec::new();

        for (from, source) in workers.iter().enumerate() {
            if !source.is_active() || source.load.cpu_load_estimate <= self.overload_threshold {
                continue;
            }
            let Some(tail) = source.local_queue.back() else {
                continue;
            };

            let target = workers.iter().enumerate().find(|(to, candidate)| {
                *to != from
                    && !taken.contains(to)
                    && candidate.status == WorkerStatus::Idle
                    && candidate.accepts(tail.task_type, self.queue_bound)
            });

            if let Some((to, _)) = target {
                taken.insert(from);
                taken.insert(to);
                moves.push((from, to));
            }
        }

        moves
    }
}

impl WorkerPool {
    /// Runs one health sweep.
    ///
    /// A task whose reclaim fails is kept as a pending move and retried on
    /// the next sweep.
    pub async fn health_sweep(&self, monitor: &HealthMonitor, now: DateTime<Utc>) -> HealthReport {
        // Held across the store writes below: a worker finishing a reclaimed
        // task must observe the slot already drained.
        let mut state = self.lock_state().await;
        let mut report = HealthReport::default();

        report.repaired = self.retry_pending_moves(&mut state).await;

        // Stale detection and reclaim
        let mut orphans: Vec<Task> = Vec::new();
        for worker in state.workers.iter_mut() {
            if monitor.is_stale(worker, now) {
                warn!(
                    worker_id = %worker.id,
                    last_activity_at = %worker.last_activity_at,
                    current_task = ?worker.current_task(),
                    queue_depth = worker.queue_depth(),
                    "Worker is stale, marking offline"
                );
                report.marked_offline.push(worker.id.clone());
                orphans.extend(worker.take_offline());
            } else if !worker.is_active() && !worker.is_drained() {
                orphans.extend(worker.take_offline());
            }
        }

        for mut task in orphans {
            task.mark_queued(now);
            match self.store.requeue(&task, score_of(&task)).await {
                Ok(true) => {
                    report.reclaimed += 1;
                    info!(task_id = %task.id, task_type = %task.task_type, "Reclaimed task from offline worker");
                }
                Ok(false) => debug!(task_id = %task.id, "Task was already moved, nothing to reclaim"),
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to reclaim task");
                    state.defer_move(PendingMove::Requeue(task));
                }
            }
        }

        // Load refresh
        for worker in state.workers.iter_mut() {
            worker.refresh_load(monitor.queue_bound, monitor.overload_threshold, now);
        }

        // Rebalance
        for (from, to) in monitor.plan_rebalance(&state.workers) {
            let Some(mut task) = state.workers[from].local_queue.pop_back() else {
                continue;
            };
            let source_id = state.workers[from].id.clone();
            let target = &mut state.workers[to];
            task.assigned_worker_id = Some(target.id.clone());
            info!(
                task_id = %task.id,
                from = %source_id,
                to = %target.id,
                "Rebalanced task"
            );
            target.local_queue.push_back(task);
            target.notify.notify_one();
            report.rebalanced += 1;

            state.workers[from].refresh_load(monitor.queue_bound, monitor.overload_threshold, now);
            state.workers[to].refresh_load(monitor.queue_bound, monitor.overload_threshold, now);
        }

        report.pending_moves = state.pending_moves();
        report.overloaded = state
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Overloaded)
            .count();

        report
    }
}
