//! Retry with exponential backoff, then dead-lettering.
//!
//! On a failed execution the task's attempt count goes up by one. While
//! attempts remain, the task is moved from Processing back to Queued with
//! `eligible_at = now + base_delay * 2^attempt_count`, so the dispatcher
//! skips it until the delay has elapsed. Once `attempt_count` reaches
//! `max_attempts` the task is moved to DeadLetter with the last error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tracing::{error, warn};

use crate::error::HandlerError;
use crate::metrics::MetricsCollector;

use super::store::{score_of, QueueError, QueueStore};
use super::task::{Task, TaskStatus};

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Extra delay as a fraction of the base schedule, drawn from `[0, jitter)`.
    /// Kept below 1 so that each delay is strictly longer than the previous one.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Delay before the next execution, given the attempt count after the failure.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_count);
        let delay = self.base_delay.saturating_mul(factor);

        if self.jitter <= 0.0 {
            return delay;
        }

        let spread = rand::rng().random_range(0.0..self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + spread)).unwrap_or(Duration::MAX)
    }
}

/// What happened to a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Re-queued, not eligible before `eligible_at`.
    Retry {
        attempt: u32,
        delay: Duration,
        eligible_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the task is in DeadLetter.
    DeadLettered { attempt: u32 },
    /// The task was no longer in Processing, so someone else already moved it
    /// (typically a reclaim). Nothing was changed.
    Superseded,
}

/// Applies the retry policy to failed tasks.
pub struct RetryHandler {
    policy: RetryPolicy,
    store: Arc<dyn QueueStore>,
    metrics: MetricsCollector,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy, store: Arc<dyn QueueStore>) -> Self {
        Self {
            policy,
            store,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a failed execution of `task` and re-queues or dead-letters it.
    ///
    /// `task` is updated in place (attempt count, error, eligibility).
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the store rejects the move. `task` already holds
    /// the intended state (`Failed` for a dead-letter, `Queued` for a retry),
    /// so the caller can attempt the same move again later.
    pub async fn handle_failure(
        &self,
        task: &mut Task,
        failure: &HandlerError,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueError> {
        task.increment_attempts();
        task.error = Some(failure.to_string());
        let attempt = task.attempt_count;

        if !task.should_retry() {
            task.status = TaskStatus::Failed;
            let message = failure.to_string();
            if !self.store.move_to_dead_letter(task, &message).await? {
                return Ok(FailureDisposition::Superseded);
            }

            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = attempt,
                error = %message,
                "Task exhausted its attempts, moved to dead letter"
            );
            return Ok(FailureDisposition::DeadLettered { attempt });
        }

        let delay = self.policy.delay_for(attempt);
        let eligible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        task.mark_queued(eligible_at);

        if !self.store.requeue(task, score_of(task)).await? {
            return Ok(FailureDisposition::Superseded);
        }

        self.metrics.record_retry(task.task_type.as_str());
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = attempt,
            remaining_attempts = task.remaining_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Task failed, requeued with backoff"
        );

        Ok(FailureDisposition::Retry {
            attempt,
            delay,
            eligible_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::memory_store::MemoryQueueStore;
    use crate::scheduler::task::{Priority, TaskType};

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(Duration::from_secs(1));
        assert!(policy.delay_for(200) >= policy.delay_for(31));
    }

    #[test]
    fn test_jitter_keeps_delays_increasing() {
        let policy = RetryPolicy::new(Duration::from_millis(50)).with_jitter(0.9);
        for _ in 0..50 {
            for attempt in 1..8 {
                let current = policy.delay_for(attempt);
                let next = policy.delay_for(attempt + 1);
                assert!(next > current, "attempt {attempt}: {next:?} <= {current:?}");
            }
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        let policy = RetryPolicy::new(Duration::from_millis(1)).with_jitter(5.0);
        assert!(policy.jitter < 1.0);
    }

    async fn processing_task(store: &MemoryQueueStore, max_attempts: u32) -> Task {
        let task = Task::new(TaskType::Validation, serde_json::Value::Null, Priority::High)
            .with_max_attempts(max_attempts);
        store.enqueue(&task, score_of(&task)).await.unwrap();
        store.move_to_processing(task.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let store = Arc::new(MemoryQueueStore::default());
        let handler = RetryHandler::new(RetryPolicy::new(Duration::from_secs(1)), store.clone());
        let mut task = processing_task(&store, 3).await;

        let now = Utc::now();
        let disposition = handler
            .handle_failure(&mut task, &HandlerError::failed("boom"), now)
            .await
            .unwrap();

        match disposition {
            FailureDisposition::Retry {
                attempt,
                delay,
                eligible_at,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(eligible_at, now + chrono::Duration::seconds(2));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        assert!(store.is_queued(task.id).await);
        assert!(!store.is_processing(task.id).await);
        // Backing off: not dispatchable yet.
        assert!(store.dequeue_max(now).await.unwrap().is_none());
        let later = now + chrono::Duration::seconds(3);
        assert_eq!(store.dequeue_max(later).await.unwrap().unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_last_attempt_dead_letters() {
        let store = Arc::new(MemoryQueueStore::default());
        let handler = RetryHandler::new(RetryPolicy::new(Duration::from_millis(1)), store.clone());
        let mut task = processing_task(&store, 1).await;

        let disposition = handler
            .handle_failure(&mut task, &HandlerError::Timeout(Duration::from_secs(5)), Utc::now())
            .await
            .unwrap();

        assert_eq!(disposition, FailureDisposition::DeadLettered { attempt: 1 });
        let entries = store.peek_dead_letter(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task.attempt_count, entries[0].task.max_attempts);
        assert!(entries[0].last_error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_failure_of_reclaimed_task_is_superseded() {
        let store = Arc::new(MemoryQueueStore::default());
        let handler = RetryHandler::new(RetryPolicy::new(Duration::from_millis(1)), store.clone());
        let mut task = processing_task(&store, 3).await;

        // Someone else already returned it to Queued.
        let mut reclaimed = task.clone();
        reclaimed.mark_queued(Utc::now());
        assert!(store.requeue(&reclaimed, score_of(&reclaimed)).await.unwrap());

        let disposition = handler
            .handle_failure(&mut task, &HandlerError::failed("late"), Utc::now())
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Superseded);
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }
}
