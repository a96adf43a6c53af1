//! # Key-Value Backends
//!
//! Independent key-value instances shared by the lock manager (quorum set) and the
//! remote cache tier.
//!
//! ```text
//! KvProvider (enum)              <- Zero-cost dispatch, no vtable
//!   ├── Redis(RedisKvBackend)      <- ConnectionManager-based async Redis
//!   └── Memory(MemoryKvBackend)    <- In-process store with outage toggle
//! ```
//!
//! Lock keys live under `lock:` and cache keys under `cache:`; the prefixes are the
//! only partitioning between the two writers.

pub mod errors;
pub mod health;
pub mod provider;
pub mod providers;
pub mod traits;

pub use errors::{KvError, KvResult};
pub use health::{BackendHealth, BackendHealthSupervisor};
pub use provider::KvProvider;
pub use providers::{MemoryKvBackend, RedisKvBackend};
pub use traits::KvStore;
