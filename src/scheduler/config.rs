//! Scheduler configuration.
//!
//! Covers the queue store location, worker pool bounds, retry policy and the
//! timings of the control loop (autoscaler, health monitor, rebalancer).

use std::time::Duration;

use thiserror::Error;

use super::task::DEFAULT_MAX_ATTEMPTS;

/// Redis URL used when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Queue name used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "taskforge";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the queue (prefix for store keys).
    pub queue_name: String,

    // Worker pool settings
    /// Workers created on start, and the floor for scale-down.
    pub min_workers: usize,
    /// Ceiling on non-offline workers.
    pub max_workers: usize,
    /// Maximum length of a worker's local queue.
    pub worker_queue_bound: usize,
    /// Maximum time a handler may run before the attempt counts as failed.
    pub task_timeout: Duration,

    // Retry settings
    /// Attempt limit applied when a request does not set its own.
    pub max_attempts: u32,
    /// Base of the exponential backoff (`base * 2^attempt`).
    pub retry_base_delay: Duration,
    /// Upper bound of the multiplicative jitter added to each backoff, in `[0, 1)`.
    pub retry_jitter: f64,

    // Control loop settings
    /// Interval of the autoscaler / health monitor loop.
    pub tick_interval: Duration,
    /// How often idle workers refresh `last_activity_at`.
    pub heartbeat_interval: Duration,
    /// Workers silent for longer than this are marked offline.
    pub stale_threshold: Duration,
    /// Average local queue length that triggers a scale-up.
    pub scale_up_threshold: f64,
    /// Number of simultaneously idle workers tolerated before scaling down.
    pub max_idle_workers: usize,
    /// How long a worker must stay idle before it can be retired.
    pub idle_timeout: Duration,
    /// Minimum time between two scaling actions.
    pub scaling_cooldown: Duration,
    /// CPU estimate (0-100) above which a worker counts as overloaded.
    pub overload_threshold: f64,
    /// Age after which a task still waiting for capacity raises an alert.
    pub backlog_alert_after: Duration,
    /// Maximum number of queued tasks moved per dispatch pass.
    pub dispatch_batch: usize,
    /// Number of finished outcomes kept for inspection.
    pub result_history: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // Store defaults
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),

            // Pool defaults
            min_workers: 1,
            max_workers: 8,
            worker_queue_bound: 10,
            task_timeout: Duration::from_secs(300),

            // Retry defaults
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
            retry_jitter: 0.0,

            // Control loop defaults
            tick_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(600),
            scale_up_threshold: 5.0,
            max_idle_workers: 2,
            idle_timeout: Duration::from_secs(120),
            scaling_cooldown: Duration::from_secs(30),
            overload_threshold: 80.0,
            backlog_alert_after: Duration::from_secs(300),
            dispatch_batch: 64,
            result_history: 256,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKFORGE_REDIS_URL`: Redis URL (default: redis://127.0.0.1:6379)
    /// - `TASKFORGE_QUEUE_NAME`: Queue key prefix (default: taskforge)
    /// - `TASKFORGE_MIN_WORKERS`: Worker floor (default: 1)
    /// - `TASKFORGE_MAX_WORKERS`: Worker ceiling (default: 8)
    /// - `TASKFORGE_WORKER_QUEUE_BOUND`: Local queue bound (default: 10)
    /// - `TASKFORGE_TASK_TIMEOUT_SECS`: Handler timeout (default: 300)
    /// - `TASKFORGE_MAX_ATTEMPTS`: Attempt limit (default: 3)
    /// - `TASKFORGE_RETRY_BASE_DELAY_MS`: Backoff base (default: 1000)
    /// - `TASKFORGE_RETRY_JITTER`: Backoff jitter fraction (default: 0.0)
    /// - `TASKFORGE_TICK_INTERVAL_MS`: Control loop interval (default: 5000)
    /// - `TASKFORGE_HEARTBEAT_INTERVAL_MS`: Idle heartbeat (default: 5000)
    /// - `TASKFORGE_STALE_THRESHOLD_SECS`: Staleness threshold (default: 600)
    /// - `TASKFORGE_SCALE_UP_THRESHOLD`: Average queue length for scale-up (default: 5.0)
    /// - `TASKFORGE_MAX_IDLE_WORKERS`: Idle workers tolerated (default: 2)
    /// - `TASKFORGE_IDLE_TIMEOUT_SECS`: Idle time before retirement (default: 120)
    /// - `TASKFORGE_SCALING_COOLDOWN_SECS`: Cooldown between scaling actions (default: 30)
    /// - `TASKFORGE_OVERLOAD_THRESHOLD`: CPU estimate for overload (default: 80.0)
    /// - `TASKFORGE_BACKLOG_ALERT_SECS`: Backlog alert age (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Store settings
        if let Ok(val) = std::env::var("TASKFORGE_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("TASKFORGE_QUEUE_NAME") {
            config.queue_name = val;
        }

        // Pool settings
        if let Ok(val) = std::env::var("TASKFORGE_MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "TASKFORGE_MIN_WORKERS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "TASKFORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_WORKER_QUEUE_BOUND") {
            config.worker_queue_bound = parse_env_value(&val, "TASKFORGE_WORKER_QUEUE_BOUND")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_TASK_TIMEOUT_SECS")?;
            config.task_timeout = Duration::from_secs(secs);
        }

        // Retry settings
        if let Ok(val) = std::env::var("TASKFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "TASKFORGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_RETRY_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFORGE_RETRY_BASE_DELAY_MS")?;
            config.retry_base_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFORGE_RETRY_JITTER") {
            config.retry_jitter = parse_env_value(&val, "TASKFORGE_RETRY_JITTER")?;
        }

        // Control loop settings
        if let Ok(val) = std::env::var("TASKFORGE_TICK_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFORGE_TICK_INTERVAL_MS")?;
            config.tick_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFORGE_HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFORGE_HEARTBEAT_INTERVAL_MS")?;
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFORGE_STALE_THRESHOLD_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_STALE_THRESHOLD_SECS")?;
            config.stale_threshold = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_SCALE_UP_THRESHOLD") {
            config.scale_up_threshold = parse_env_value(&val, "TASKFORGE_SCALE_UP_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_MAX_IDLE_WORKERS") {
            config.max_idle_workers = parse_env_value(&val, "TASKFORGE_MAX_IDLE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_IDLE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_IDLE_TIMEOUT_SECS")?;
            config.idle_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_SCALING_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_SCALING_COOLDOWN_SECS")?;
            config.scaling_cooldown = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_OVERLOAD_THRESHOLD") {
            config.overload_threshold = parse_env_value(&val, "TASKFORGE_OVERLOAD_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_BACKLOG_ALERT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_BACKLOG_ALERT_SECS")?;
            config.backlog_alert_after = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(
                "min_workers cannot exceed max_workers".to_string(),
            ));
        }

        if self.worker_queue_bound == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_queue_bound must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry_base_delay must be greater than 0".to_string(),
            ));
        }

        // Jitter below 1.0 keeps every backoff strictly longer than the previous one.
        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::ValidationFailed(
                "retry_jitter must be in [0.0, 1.0)".to_string(),
            ));
        }

        if self.tick_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tick_interval and heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.stale_threshold <= self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "stale_threshold must exceed heartbeat_interval".to_string(),
            ));
        }

        // A busy worker only reports activity when its task starts and ends.
        if self.stale_threshold <= self.task_timeout.saturating_add(self.heartbeat_interval) {
            return Err(ConfigError::ValidationFailed(
                "stale_threshold must exceed task_timeout plus heartbeat_interval".to_string(),
            ));
        }

        if self.scale_up_threshold <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "scale_up_threshold must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.overload_threshold) {
            return Err(ConfigError::ValidationFailed(
                "overload_threshold must be between 0 and 100".to_string(),
            ));
        }

        if self.dispatch_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch_batch must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the worker floor and ceiling.
    pub fn with_worker_limits(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    /// Sets the local queue bound.
    pub fn with_worker_queue_bound(mut self, bound: usize) -> Self {
        self.worker_queue_bound = bound;
        self
    }

    /// Sets the handler timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the default attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff base delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Sets the backoff jitter fraction.
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Sets the control loop interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the idle heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Sets the scale-up threshold.
    pub fn with_scale_up_threshold(mut self, threshold: f64) -> Self {
        self.scale_up_threshold = threshold;
        self
    }

    /// Sets the scale-down policy.
    pub fn with_idle_policy(mut self, max_idle_workers: usize, idle_timeout: Duration) -> Self {
        self.max_idle_workers = max_idle_workers;
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the scaling cooldown.
    pub fn with_scaling_cooldown(mut self, cooldown: Duration) -> Self {
        self.scaling_cooldown = cooldown;
        self
    }

    /// Sets the overload threshold.
    pub fn with_overload_threshold(mut self, threshold: f64) -> Self {
        self.overload_threshold = threshold;
        self
    }

    /// Sets the backlog alert age.
    pub fn with_backlog_alert_after(mut self, age: Duration) -> Self {
        self.backlog_alert_after = age;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}
