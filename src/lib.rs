#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Resilience Core
//!
//! Resilience primitives for the reminder service: quorum locking across independent
//! key-value instances, a tiered cache with stampede protection, a priority task
//! scheduler with retries and timeouts, and a load-adaptive degradation controller.
//!
//! ## Module Organization
//!
//! - [`kv`] - Key-value providers (Redis, in-memory) and the health supervisor
//! - [`lock`] - Redlock-style quorum locks with lease renewal
//! - [`cache`] - Memory, remote and disk tiers behind one [`CacheLayer`]
//! - [`scheduler`] - Priority queue, bounded concurrency, retries and persistence
//! - [`degradation`] - Load classification, hysteresis and primary/fallback dispatch
//! - [`config`] - Layered configuration with validated hot reload
//! - [`events`] - Typed broadcast event fan-out
//! - [`errors`] - Crate-wide error taxonomy
//! - [`logging`] - Structured logging setup
//! - [`system_context`] - Builds and owns every component
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_core::{logging, ResilienceContext, TaskOptions, TaskPriority};
//! use serde_json::json;
//!
//! # async fn example() -> resilience_core::ResilienceResult<()> {
//! logging::init_tracing();
//!
//! let context = ResilienceContext::new().await?;
//! context.scheduler.register_fn("send_reminder", |ctx| async move {
//!     Ok(json!({ "sent": ctx.payload["user"] }))
//! });
//! context.start().await?;
//!
//! context
//!     .scheduler
//!     .add_task(
//!         "send_reminder",
//!         json!({ "user": 42 }),
//!         TaskOptions::new().with_priority(TaskPriority::High),
//!     )
//!     .await?;
//!
//! context.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod degradation;
pub mod errors;
pub mod events;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod scheduler;
pub mod system_context;

pub use cache::{CacheLayer, CacheLookup, CacheStats, CacheTier};
pub use config::{ConfigHandle, ConfigManager, ResilienceConfig};
pub use degradation::{
    service_fn, DegradationController, LoadSample, RequestMetrics, ServiceHandler,
    ServicePriority, SystemState,
};
pub use errors::{ResilienceError, ResilienceResult};
pub use events::{EventPublisher, PublishedEvent, ResilienceEvent};
pub use kv::{KvProvider, KvStore, MemoryKvBackend, RedisKvBackend};
pub use lock::{AcquireOptions, Lock, LockManager, LockMode};
pub use scheduler::{
    handler_fn, Task, TaskContext, TaskHandler, TaskOptions, TaskPriority, TaskScheduler,
    TaskStatus,
};
pub use system_context::ResilienceContext;
