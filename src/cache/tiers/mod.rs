//! Cache tier implementations
//!
//! ```text
//! TierBackend (enum)             <- Zero-cost dispatch, read in order
//!   ├── Memory(MemoryTier)         <- moka, per-record expiry
//!   ├── Remote(RemoteTier)         <- shared key-value instance
//!   └── Disk(DiskTier)             <- one JSON file per key
//! ```

pub mod disk;
pub mod memory;
pub mod remote;

pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use remote::RemoteTier;

use super::entry::{CacheRecord, CacheTier};
use crate::errors::ResilienceResult;
use std::future::Future;

/// Operations every tier supports
///
/// `get` never returns an expired record; tiers drop expired records they encounter.
pub trait CacheStore: Send + Sync {
    fn tier(&self) -> CacheTier;

    fn get(&self, key: &str)
        -> impl Future<Output = ResilienceResult<Option<CacheRecord>>> + Send;

    fn put(&self, record: &CacheRecord) -> impl Future<Output = ResilienceResult<()>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = ResilienceResult<bool>> + Send;

    /// Remove every key starting with `prefix`; returns how many were removed
    fn clear_prefix(&self, prefix: &str) -> impl Future<Output = ResilienceResult<u64>> + Send;
}

/// One enabled tier
#[derive(Debug, Clone)]
pub enum TierBackend {
    Memory(MemoryTier),
    Remote(RemoteTier),
    Disk(DiskTier),
}

impl CacheStore for TierBackend {
    fn tier(&self) -> CacheTier {
        match self {
            Self::Memory(t) => t.tier(),
            Self::Remote(t) => t.tier(),
            Self::Disk(t) => t.tier(),
        }
    }

    async fn get(&self, key: &str) -> ResilienceResult<Option<CacheRecord>> {
        match self {
            Self::Memory(t) => t.get(key).await,
            Self::Remote(t) => t.get(key).await,
            Self::Disk(t) => t.get(key).await,
        }
    }

    async fn put(&self, record: &CacheRecord) -> ResilienceResult<()> {
        match self {
            Self::Memory(t) => t.put(record).await,
            Self::Remote(t) => t.put(record).await,
            Self::Disk(t) => t.put(record).await,
        }
    }

    async fn remove(&self, key: &str) -> ResilienceResult<bool> {
        match self {
            Self::Memory(t) => t.remove(key).await,
            Self::Remote(t) => t.remove(key).await,
            Self::Disk(t) => t.remove(key).await,
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> ResilienceResult<u64> {
        match self {
            Self::Memory(t) => t.clear_prefix(prefix).await,
            Self::Remote(t) => t.clear_prefix(prefix).await,
            Self::Disk(t) => t.clear_prefix(prefix).await,
        }
    }
}
