//! # Cache Layer
//!
//! Tiered caching (process memory, shared key-value store, local disk) with protection
//! against the three classic failure modes:
//!
//! - **Stampede**: concurrent misses for one key collapse into a single fill guarded by
//!   the quorum lock.
//! - **Penetration**: fills that find nothing store a short-lived tombstone, so repeated
//!   lookups for absent keys stop reaching the source.
//! - **Avalanche**: every write jitters its TTL so entries written together do not expire
//!   together.
//!
//! ```rust,no_run
//! # use resilience_core::cache::CacheLayer;
//! # use serde_json::json;
//! # async fn example(cache: &CacheLayer) -> resilience_core::ResilienceResult<()> {
//! let holidays = cache
//!     .get_or_fill("holidays", "2025", || async { Ok(Some(json!(["new-year"]))) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod jitter;
pub mod layer;
pub mod stats;
pub mod tiers;

pub use entry::{CacheLookup, CacheRecord, CacheTier};
pub use jitter::{jitter_bounds, jittered_ttl};
pub use layer::CacheLayer;
pub use stats::{CacheStats, TierStats};
pub use tiers::{CacheStore, DiskTier, MemoryTier, RemoteTier, TierBackend};
