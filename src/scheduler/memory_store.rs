//! In-process queue store.
//!
//! Implements [`QueueStore`] with the same semantics as the Redis store but
//! keeps everything behind a single mutex. Useful for embedded deployments
//! without Redis and as the store used by the test suite.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{eligible_range, queue_score, DeadLetterEntry, QueueError, QueueStats, QueueStore};
use super::task::{Priority, Task, TaskStatus};

/// Ranking key: score first, insertion sequence to keep FIFO on equal scores.
type RankKey = (OrderedFloat<f64>, u64);

#[derive(Default)]
struct MemoryState {
    ranking: BTreeMap<RankKey, Uuid>,
    queued: HashMap<Uuid, (RankKey, Task)>,
    processing: HashMap<Uuid, Task>,
    /// Newest entry at the front.
    dead_letter: VecDeque<DeadLetterEntry>,
    next_seq: u64,
}

impl MemoryState {
    fn insert_queued(&mut self, task: Task, score: f64) {
        let key = (OrderedFloat(score), self.next_seq);
        self.next_seq += 1;
        self.ranking.insert(key, task.id);
        self.queued.insert(task.id, (key, task));
    }

    fn remove_queued(&mut self, task_id: Uuid) -> Option<Task> {
        let (key, task) = self.queued.remove(&task_id)?;
        self.ranking.remove(&key);
        Some(task)
    }

    fn contains(&self, task_id: Uuid) -> bool {
        self.queued.contains_key(&task_id) || self.processing.contains_key(&task_id)
    }
}

/// Queue store kept in process memory.
pub struct MemoryQueueStore {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Returns whether the task is currently queued.
    pub async fn is_queued(&self, task_id: Uuid) -> bool {
        self.state.lock().await.queued.contains_key(&task_id)
    }

    /// Returns whether the task is currently processing.
    pub async fn is_processing(&self, task_id: Uuid) -> bool {
        self.state.lock().await.processing.contains_key(&task_id)
    }

    /// Returns whether the task is in the dead-letter collection.
    pub async fn is_dead_lettered(&self, task_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .dead_letter
            .iter()
            .any(|entry| entry.task.id == task_id)
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: &Task, score: f64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.contains(task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }
        state.insert_queued(task.clone(), score);
        Ok(())
    }

    async fn dequeue_max(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().await;

        let mut found = None;
        for priority in Priority::DESCENDING {
            let (low, high) = eligible_range(priority, now);
            let range = (OrderedFloat(low), 0)..=(OrderedFloat(high), u64::MAX);
            if let Some((_, id)) = state.ranking.range(range).next() {
                found = Some(*id);
                break;
            }
        }

        let Some(task_id) = found else {
            return Ok(None);
        };
        let Some(mut task) = state.remove_queued(task_id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Processing;
        state.processing.insert(task_id, task.clone());
        Ok(Some(task))
    }

    async fn move_to_processing(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.remove_queued(task_id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Processing;
        state.processing.insert(task_id, task.clone());
        Ok(Some(task))
    }

    async fn complete(&self, task_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.processing.remove(&task_id).is_some())
    }

    async fn requeue(&self, task: &Task, score: f64) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.processing.remove(&task.id).is_none() {
            return Ok(false);
        }
        state.insert_queued(task.clone(), score);
        Ok(true)
    }

    async fn move_to_dead_letter(&self, task: &Task, error: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.processing.remove(&task.id).is_none() {
            return Ok(false);
        }
        state
            .dead_letter
            .push_front(DeadLetterEntry::new(task.clone(), error));
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queue_name: self.name.clone(),
            queued: state.queued.len(),
            processing: state.processing.len(),
            dead_letter: state.dead_letter.len(),
        })
    }

    async fn peek_queued(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .ranking
            .values()
            .take(limit)
            .filter_map(|id| state.queued.get(id).map(|(_, task)| task.clone()))
            .collect())
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letter.iter().take(limit).cloned().collect())
    }

    async fn replay_dead_letter(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(position) = state
            .dead_letter
            .iter()
            .position(|entry| entry.task.id == task_id)
        else {
            return Ok(None);
        };
        let Some(entry) = state.dead_letter.remove(position) else {
            return Ok(None);
        };

        let mut task = entry.task;
        task.attempt_count = 0;
        task.error = None;
        task.mark_queued(now);
        state.insert_queued(task.clone(), queue_score(task.priority, now));
        Ok(Some(task))
    }

    async fn recover_processing(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let orphaned: Vec<Task> = state.processing.drain().map(|(_, task)| task).collect();
        let recovered = orphaned.len();
        for mut task in orphaned {
            task.mark_queued(now);
            let score = queue_score(task.priority, now);
            state.insert_queued(task, score);
        }
        Ok(recovered)
    }
}
