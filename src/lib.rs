//! taskforge: task scheduling core with an autoscaled worker pool.
//!
//! This library accepts heterogeneous units of work, assigns them to a
//! dynamically sized pool of workers and guarantees eventual completion or
//! quarantine in a dead-letter collection.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use error::{HandlerError, SchedulerError};
pub use scheduler::{
    HandlerRegistry, Priority, QueueStore, Scheduler, SchedulerConfig, SchedulerStatus, Task,
    TaskHandler, TaskRequest, TaskType,
};
