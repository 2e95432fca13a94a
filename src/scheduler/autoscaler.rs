//! Autoscaler: grows and shrinks the pool from queue pressure.
//!
//! Evaluated once per control cycle:
//!
//! - **Floor**: fewer than `min_workers` active workers → create one with
//!   every registered capability.
//! - **Scale up**: average local-queue length over active workers above
//!   `scale_up_threshold`, and below the ceiling → create one worker capable
//!   of the task type driving demand.
//! - **Scale down**: more than `max_idle_workers` idle workers with empty
//!   queues, and above the floor → retire the oldest of those that has been
//!   idle for at least `idle_timeout`.
//!
//! Scale up and scale down share one cooldown, so the pool never flips
//! direction within `scaling_cooldown`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::metrics::ScalingDirection;

use super::config::SchedulerConfig;
use super::store::score_of;
use super::task::TaskType;
use super::worker::{WorkerSlot, WorkerStatus};
use super::worker_pool::WorkerPool;

/// Decision made by the autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScalingDecision {
    /// No action needed.
    None,
    /// Create one worker with these capabilities.
    ScaleUp {
        capabilities: HashSet<TaskType>,
        reason: String,
    },
    /// Retire this worker.
    ScaleDown { worker_id: String, reason: String },
}

/// Scaling thresholds plus the time of the last action.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    scale_up_threshold: f64,
    max_idle_workers: usize,
    idle_timeout: Duration,
    cooldown: Duration,
    min_workers: usize,
    max_workers: usize,
    last_action: Option<DateTime<Utc>>,
}

impl Autoscaler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            scale_up_threshold: config.scale_up_threshold,
            max_idle_workers: config.max_idle_workers,
            idle_timeout: config.idle_timeout,
            cooldown: config.scaling_cooldown,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            last_action: None,
        }
    }

    /// Returns whether the last action is more recent than the cooldown.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_action
            .is_some_and(|at| elapsed(at, now) < self.cooldown)
    }

    /// Starts the cooldown.
    pub fn record_action(&mut self, now: DateTime<Utc>) {
        self.last_action = Some(now);
    }

    /// Decides what to do given the current workers.
    ///
    /// `registered` is the set of task types with a handler, used when no
    /// single type is driving demand.
    pub fn evaluate(
        &self,
        workers: &[WorkerSlot],
        registered: &[TaskType],
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let active: Vec<&WorkerSlot> = workers.iter().filter(|w| w.is_active()).collect();

        if active.len() < self.min_workers {
            return ScalingDecision::ScaleUp {
                capabilities: registered.iter().copied().collect(),
                reason: format!("{} active workers, floor is {}", active.len(), self.min_workers),
            };
        }

        if self.in_cooldown(now) || active.is_empty() {
            return ScalingDecision::None;
        }

        let queued: usize = active.iter().map(|w| w.queue_depth()).sum();
        let average_queue_length = queued as f64 / active.len() as f64;

        if average_queue_length > self.scale_up_threshold && active.len() < self.max_workers {
            return ScalingDecision::ScaleUp {
                capabilities: demand_capabilities(&active, registered),
                reason: format!(
                    "average queue length {:.1} above {:.1}",
                    average_queue_length, self.scale_up_threshold
                ),
            };
        }

        let idle: Vec<&WorkerSlot> = active
            .iter()
            .copied()
            .filter(|w| w.status == WorkerStatus::Idle && w.is_drained())
            .collect();

        if idle.len() > self.max_idle_workers && active.len() > self.min_workers {
            let retiree = idle
                .iter()
                .filter(|w| {
                    w.idle_since
                        .is_some_and(|since| elapsed(since, now) >= self.idle_timeout)
                })
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));

            if let Some(worker) = retiree {
                return ScalingDecision::ScaleDown {
                    worker_id: worker.id.clone(),
                    reason: format!(
                        "{} idle workers, at most {} wanted",
                        idle.len(),
                        self.max_idle_workers
                    ),
                };
            }
        }

        ScalingDecision::None
    }
}

/// Capabilities for a new worker: the most common task type waiting in local
/// queues, or every registered type when nothing is waiting.
fn demand_capabilities(active: &[&WorkerSlot], registered: &[TaskType]) -> HashSet<TaskType> {
    let mut demand: HashMap<TaskType, usize> = HashMap::new();
    for worker in active {
        for task in &worker.local_queue {
            *demand.entry(task.task_type).or_default() += 1;
        }
    }

    demand
        .into_iter()
        .max_by(|(type_a, count_a), (type_b, count_b)| {
            count_a.cmp(count_b).then_with(|| type_b.cmp(type_a))
        })
        .map(|(task_type, _)| [task_type].into_iter().collect())
        .unwrap_or_else(|| registered.iter().copied().collect())
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

impl WorkerPool {
    /// Evaluates the autoscaler and applies its decision.
    pub async fn autoscale(
        self: &Arc<Self>,
        autoscaler: &mut Autoscaler,
        now: DateTime<Utc>,
    ) -> Result<ScalingDecision, SchedulerError> {
        let registered = self.handlers().registered_types();
        let mut state = self.lock_state().await;
        let decision = autoscaler.evaluate(&state.workers, &registered, now);

        match &decision {
            ScalingDecision::None => return Ok(decision),
            ScalingDecision::ScaleUp {
                capabilities,
                reason,
            } => {
                let Some(index) = self.spawn_worker(&mut state, capabilities.clone()) else {
                    return Ok(ScalingDecision::None);
                };
                info!(
                    worker_id = %state.workers[index].id,
                    active_workers = state.active_count(),
                    reason = %reason,
                    "Scaled up"
                );
                self.metrics.record_scaling(ScalingDirection::Up);
            }
            ScalingDecision::ScaleDown { worker_id, reason } => {
                let Some(worker) = state.worker_mut(worker_id) else {
                    return Ok(ScalingDecision::None);
                };
                for mut task in worker.take_offline() {
                    task.mark_queued(now);
                    if let Err(e) = self.store.requeue(&task, score_of(&task)).await {
                        warn!(task_id = %task.id, error = %e, "Failed to requeue task of retired worker");
                    }
                }
                info!(
                    worker_id = %worker_id,
                    active_workers = state.active_count(),
                    reason = %reason,
                    "Scaled down"
                );
                self.metrics.record_scaling(ScalingDirection::Down);
            }
        }

        autoscaler.record_action(now);
        Ok(decision)
    }
}
