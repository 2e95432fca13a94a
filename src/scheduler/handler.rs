//! Task handler contract and registry.
//!
//! Handlers perform the actual work of a task. The scheduler knows nothing
//! about their internals: it hands over the task type and payload, waits up to
//! the configured timeout, and treats any error, panic or timeout the same way.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

pub use crate::error::HandlerError;

use super::task::TaskType;

/// Executes tasks of one or more task types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs a task and returns its result.
    async fn execute(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskType, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskType, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn execute(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        (self.func)(task_type, payload).await
    }
}

/// Table mapping each task type to its handler.
///
/// Filled once at startup; the scheduler only reads it afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a task type, replacing any previous one.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type, handler);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_handler(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    /// Registers one handler for every task type.
    pub fn with_handler_for_all(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        for task_type in TaskType::ALL {
            self.register(task_type, Arc::clone(&handler));
        }
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Returns the registered task types in declaration order.
    pub fn registered_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|task_type| self.supports(*task_type))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.registered_types())
            .finish()
    }
}
