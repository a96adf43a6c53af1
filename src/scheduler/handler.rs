//! Task handler seam

use super::types::TaskPriority;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use uuid::Uuid;

/// What a handler sees of the task it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    /// 1-based dispatch count
    pub attempt: u32,
}

/// Executes one task type
///
/// Handlers return a result or an error and never touch task state. An error is retried
/// according to the scheduler's backoff policy; its message is kept on the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapter running a closure as a [`TaskHandler`]
pub struct FnTaskHandler<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnTaskHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTaskHandler").finish_non_exhaustive()
    }
}

/// Wrap `f` as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnTaskHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnTaskHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = handler_fn(|ctx: TaskContext| async move {
            Ok(json!({"echo": ctx.payload, "attempt": ctx.attempt}))
        });
        let ctx = TaskContext {
            task_id: Uuid::new_v4(),
            task_type: "echo".to_string(),
            payload: json!("hi"),
            priority: TaskPriority::Normal,
            attempt: 1,
        };
        let out = handler.handle(ctx).await.unwrap();
        assert_eq!(out, json!({"echo": "hi", "attempt": 1}));
    }
}
