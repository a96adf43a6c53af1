//! # Task Scheduler
//!
//! Bounded in-process priority queue for background work (backups, report generation,
//! notification fan-out). Handlers are registered per task type; the scheduler owns all
//! task state and drives it through `Pending -> Running -> Completed | Failed | TimedOut`,
//! with `Retrying` in between when a run fails and attempts remain.
//!
//! ```rust,no_run
//! # use resilience_core::scheduler::{TaskContext, TaskOptions, TaskPriority, TaskScheduler};
//! # use serde_json::json;
//! # async fn example(scheduler: TaskScheduler) -> resilience_core::ResilienceResult<()> {
//! scheduler.register_fn("backup", |ctx: TaskContext| async move {
//!     Ok(json!({"backed_up": ctx.payload["database"]}))
//! });
//! let id = scheduler
//!     .add_task(
//!         "backup",
//!         json!({"database": "main"}),
//!         TaskOptions::new().with_priority(TaskPriority::High),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod persistence;
mod queue;
pub mod service;
pub mod types;

pub use handler::{handler_fn, FnTaskHandler, TaskContext, TaskHandler};
pub use service::{backoff_delay, TaskScheduler};
pub use types::{SchedulerStats, Task, TaskOptions, TaskPriority, TaskStatus};
