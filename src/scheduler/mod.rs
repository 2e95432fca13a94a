//! Task scheduling with an autoscaled worker pool and a durable priority queue.
//!
//! This module provides the scheduling core:
//!
//! - **QueueStore**: durable Queued / Processing / DeadLetter collections
//!   (Redis in production, in-memory for tests and embedded use)
//! - **WorkerPool**: named workers with bounded local queues, one task at a time each
//! - **Dispatcher**: scores workers and assigns tasks, creating capacity on demand
//! - **Autoscaler / HealthMonitor**: periodic scaling, stale detection and rebalancing
//! - **RetryHandler**: exponential backoff, then dead-lettering
//! - **Scheduler**: the service tying it all together
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Caller    │
//!                      │  (submit)    │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐        ┌──────────────┐
//!                      │  Dispatcher  │◄───────┤ Control loop │
//!                      │   (score)    │        │ health/scale │
//!                      └──────┬───────┘        └──────┬───────┘
//!                             │                       │
//!         ┌───────────────────┼───────────────────┐   │
//!         │                   │                   │   │
//!         ▼                   ▼                   ▼   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │                   │                   │
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      ┌──────────────┐
//!                      │ Queue store  │
//!                      │ queued/proc/ │
//!                      │ dead letter  │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskforge::scheduler::{FnHandler, HandlerRegistry, Scheduler, SchedulerConfig, TaskRequest, TaskType};
//!
//! let handlers = HandlerRegistry::new().with_handler(
//!     TaskType::Analysis,
//!     Arc::new(FnHandler::new(|_task_type, payload| async move { Ok(payload) })),
//! );
//!
//! let scheduler = Scheduler::connect(SchedulerConfig::from_env()?, handlers).await?;
//! scheduler.start().await?;
//!
//! let task_id = scheduler
//!     .submit(TaskRequest::new("analysis", serde_json::json!({"doc": 42})).with_priority("high"))
//!     .await?;
//!
//! let status = scheduler.status().await?;
//! println!("{} queued, {} processing", status.queued_count, status.processing_count);
//!
//! // Graceful shutdown
//! scheduler.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic moves**: every transition between collections is a conditional store operation
//! - **Crash recovery**: Processing entries are requeued when a scheduler starts
//! - **Stale reclaim**: tasks of unresponsive workers go back to Queued
//! - **Dead letter queue**: tasks that exhaust their attempts are kept with their last error
//! - **Graceful shutdown**: workers finish current tasks before stopping

pub mod autoscaler;
pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod health;
pub mod memory_store;
pub mod redis_store;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use autoscaler::{Autoscaler, ScalingDecision};
pub use config::{ConfigError, SchedulerConfig};
pub use dispatcher::{select_worker, worker_score, DispatchReport};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, TaskHandler};
pub use health::{HealthMonitor, HealthReport};
pub use memory_store::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use retry::{FailureDisposition, RetryHandler, RetryPolicy};
pub use service::{ControlReport, Scheduler, SchedulerStatus};
pub use store::{DeadLetterEntry, QueueError, QueueStats, QueueStore};
pub use task::{Priority, Task, TaskOutcome, TaskRequest, TaskStatus, TaskType};
pub use worker::{LoadMetrics, WorkerSlot, WorkerSnapshot, WorkerStatus};
pub use worker_pool::{PoolStats, WorkerPool};
