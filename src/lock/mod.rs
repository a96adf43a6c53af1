//! # Distributed Locking
//!
//! Quorum (Redlock-style) locks over the configured key-value instances, with an
//! in-process fallback table for total outages and optional background renewal.
//!
//! ## Usage
//!
//! ```no_run
//! use resilience_core::lock::{AcquireOptions, LockManager};
//! use std::time::Duration;
//!
//! # async fn example(locks: LockManager) -> resilience_core::ResilienceResult<()> {
//! let lock = locks
//!     .acquire("backup:daily", Duration::from_secs(30), AcquireOptions::new().auto_renew())
//!     .await?;
//! tokio::select! {
//!     _ = lock.lost() => { /* abort the critical section */ }
//!     _ = tokio::time::sleep(Duration::from_secs(5)) => {}
//! }
//! locks.release(&lock).await;
//! # Ok(())
//! # }
//! ```

pub mod manager;
mod memory;
pub mod renewal;
pub mod types;

pub use manager::LockManager;
pub use types::{AcquireOptions, Lock, LockMode};
