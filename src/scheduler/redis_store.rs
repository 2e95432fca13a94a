//! Redis-backed queue store.
//!
//! # Key Layout
//!
//! - `{queue_name}:queued`: sorted set of task ids ranked by queue score
//! - `{queue_name}:queued_data`: hash of task id → serialized task for queued tasks
//! - `{queue_name}:processing`: hash of task id → serialized task held by workers
//! - `{queue_name}:dead_letter`: list of serialized dead-letter entries, newest first
//!
//! # Atomicity
//!
//! Every move between collections runs as a single Lua script, so Redis
//! applies it as one step. Each script first checks that the task is in the
//! source collection and does nothing otherwise, which makes reclaim and
//! requeue safe to repeat.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::store::{
    eligible_range, queue_score, DeadLetterEntry, QueueError, QueueStats, QueueStore,
};
use super::task::{Priority, Task};

/// Time allowed for the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// KEYS: queued, queued_data, processing. ARGV: id, score, task json.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 or redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

// KEYS: queued, queued_data, processing. ARGV: (min, max) score pairs, one per band.
const DEQUEUE_MAX_SCRIPT: &str = r#"
for i = 1, #ARGV, 2 do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[i], ARGV[i + 1], 'LIMIT', 0, 1)
  if #ids > 0 then
    local id = ids[1]
    local data = redis.call('HGET', KEYS[2], id)
    redis.call('ZREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    if data then
      redis.call('HSET', KEYS[3], id, data)
      return data
    end
  end
end
return false
"#;

// KEYS: queued, queued_data, processing. ARGV: id.
const MOVE_TO_PROCESSING_SCRIPT: &str = r#"
local data = redis.call('HGET', KEYS[2], ARGV[1])
if not data then
  return false
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], data)
return data
"#;

// KEYS: queued, queued_data, processing. ARGV: id, score, task json.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[3], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

// KEYS: processing, dead_letter. ARGV: id, entry json.
const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[2])
return 1
"#;

// KEYS: dead_letter, queued, queued_data. ARGV: original entry json, id, score, task json.
const REPLAY_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[4])
return 1
"#;

/// Redis-based queue store.
pub struct RedisQueueStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    queued_key: String,
    queued_data_key: String,
    processing_key: String,
    dead_letter_key: String,
    enqueue_script: Script,
    dequeue_max_script: Script,
    move_to_processing_script: Script,
    requeue_script: Script,
    dead_letter_script: Script,
    replay_script: Script,
}

impl RedisQueueStore {
    /// Connects to Redis and creates a new queue store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails, or
    /// `QueueError::Timeout` if Redis does not answer in time.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        let keys = KeyLayout::new(queue_name);
        Self {
            redis,
            queue_name: queue_name.to_string(),
            queued_key: keys.queued,
            queued_data_key: keys.queued_data,
            processing_key: keys.processing,
            dead_letter_key: keys.dead_letter,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_max_script: Script::new(DEQUEUE_MAX_SCRIPT),
            move_to_processing_script: Script::new(MOVE_TO_PROCESSING_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            dead_letter_script: Script::new(DEAD_LETTER_SCRIPT),
            replay_script: Script::new(REPLAY_SCRIPT),
        }
    }

    /// Deletes all three collections.
    ///
    /// **Warning**: This permanently deletes all tasks. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.queued_key)
            .del(&self.queued_data_key)
            .del(&self.processing_key)
            .del(&self.dead_letter_key);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn run_requeue(&self, task: &Task, score: f64) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(task)?;
        let moved: i64 = self
            .requeue_script
            .key(&self.queued_key)
            .key(&self.queued_data_key)
            .key(&self.processing_key)
            .arg(task.id.to_string())
            .arg(format_score(score))
            .arg(serialized)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }
}

/// Redis keys derived from a queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyLayout {
    queued: String,
    queued_data: String,
    processing: String,
    dead_letter: String,
}

impl KeyLayout {
    fn new(queue_name: &str) -> Self {
        Self {
            queued: format!("{}:queued", queue_name),
            queued_data: format!("{}:queued_data", queue_name),
            processing: format!("{}:processing", queue_name),
            dead_letter: format!("{}:dead_letter", queue_name),
        }
    }
}

/// Formats a score without exponent notation so Redis parses it exactly.
fn format_score(score: f64) -> String {
    format!("{:.0}", score)
}

/// Builds the `(min, max)` argument pairs for the dequeue script.
fn band_ranges(now: DateTime<Utc>) -> Vec<String> {
    Priority::DESCENDING
        .iter()
        .flat_map(|priority| {
            let (low, high) = eligible_range(*priority, now);
            [format_score(low), format_score(high)]
        })
        .collect()
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn enqueue(&self, task: &Task, score: f64) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(task)?;
        let added: i64 = self
            .enqueue_script
            .key(&self.queued_key)
            .key(&self.queued_data_key)
            .key(&self.processing_key)
            .arg(task.id.to_string())
            .arg(format_score(score))
            .arg(serialized)
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            return Err(QueueError::DuplicateTask(task.id));
        }
        Ok(())
    }

    async fn dequeue_max(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.dequeue_max_script.prepare_invoke();
        invocation
            .key(&self.queued_key)
            .key(&self.queued_data_key)
            .key(&self.processing_key);
        for bound in band_ranges(now) {
            invocation.arg(bound);
        }

        let data: Option<String> = invocation.invoke_async(&mut conn).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn move_to_processing(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = self
            .move_to_processing_script
            .key(&self.queued_key)
            .key(&self.queued_data_key)
            .key(&self.processing_key)
            .arg(task_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn
            .hdel(&self.processing_key, task_id.to_string())
            .await?;
        Ok(removed == 1)
    }

    async fn requeue(&self, task: &Task, score: f64) -> Result<bool, QueueError> {
        self.run_requeue(task, score).await
    }

    async fn move_to_dead_letter(&self, task: &Task, error: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let entry = DeadLetterEntry::new(task.clone(), error);
        let serialized = serde_json::to_string(&entry)?;

        let moved: i64 = self
            .dead_letter_script
            .key(&self.processing_key)
            .key(&self.dead_letter_key)
            .arg(task.id.to_string())
            .arg(serialized)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.zcard(&self.queued_key)
            .hlen(&self.processing_key)
            .llen(&self.dead_letter_key);
        let (queued, processing, dead_letter): (usize, usize, usize) =
            pipe.query_async(&mut conn).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            queued,
            processing,
            dead_letter,
        })
    }

    async fn peek_queued(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(&self.queued_key, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let data: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.queued_data_key)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        // Entries dispatched between the two reads come back as nil and are skipped.
        let mut tasks = Vec::with_capacity(data.len());
        for item in data.into_iter().flatten() {
            tasks.push(serde_json::from_str(&item)?);
        }
        Ok(tasks)
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_key, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetterEntry>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    async fn replay_dead_letter(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.dead_letter_key, 0, -1).await?;

        for raw in entries {
            let Ok(entry) = serde_json::from_str::<DeadLetterEntry>(&raw) else {
                continue;
            };
            if entry.task.id != task_id {
                continue;
            }

            let mut task = entry.task;
            task.attempt_count = 0;
            task.error = None;
            task.mark_queued(now);
            let serialized = serde_json::to_string(&task)?;

            let moved: i64 = self
                .replay_script
                .key(&self.dead_letter_key)
                .key(&self.queued_key)
                .key(&self.queued_data_key)
                .arg(&raw)
                .arg(task.id.to_string())
                .arg(format_score(queue_score(task.priority, now)))
                .arg(serialized)
                .invoke_async(&mut conn)
                .await?;

            return Ok((moved == 1).then_some(task));
        }

        Ok(None)
    }

    async fn recover_processing(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let held: HashMap<String, String> = conn.hgetall(&self.processing_key).await?;

        let mut recovered = 0;
        for data in held.values() {
            let Ok(mut task) = serde_json::from_str::<Task>(data) else {
                tracing::warn!(queue = %self.queue_name, "Skipping unreadable processing entry");
                continue;
            };
            task.mark_queued(now);
            if self.run_requeue(&task, queue_score(task.priority, now)).await? {
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("tasks");
        assert_eq!(keys.queued, "tasks:queued");
        assert_eq!(keys.queued_data, "tasks:queued_data");
        assert_eq!(keys.processing, "tasks:processing");
        assert_eq!(keys.dead_letter, "tasks:dead_letter");
    }

    #[test]
    fn test_format_score_has_no_exponent() {
        let score = 3.0e13 + 1_760_000_000_123.0;
        assert_eq!(format_score(score), "31760000000123");
        assert_eq!(format_score(0.0), "0");
    }

    #[test]
    fn test_band_ranges_cover_all_priorities() {
        let now = Utc::now();
        let ranges = band_ranges(now);
        assert_eq!(ranges.len(), 8);

        // Critical band first, starting at zero.
        assert_eq!(ranges[0], "0");
        let critical_max: f64 = ranges[1].parse().unwrap();
        let high_min: f64 = ranges[2].parse().unwrap();
        assert!(critical_max < high_min);
    }

    #[test]
    fn test_scripts_guard_source_collection() {
        assert!(REQUEUE_SCRIPT.contains("HDEL', KEYS[3]"));
        assert!(DEAD_LETTER_SCRIPT.contains("HDEL', KEYS[1]"));
        assert!(REPLAY_SCRIPT.contains("LREM"));
        assert!(MOVE_TO_PROCESSING_SCRIPT.contains("if not data"));
    }
}
