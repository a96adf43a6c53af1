//! Cache hit/miss accounting

use super::entry::CacheTier;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Lock-free counters shared by every cache operation
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    memory: TierCounters,
    remote: TierCounters,
    disk: TierCounters,
    misses: AtomicU64,
    tombstone_hits: AtomicU64,
    fills: AtomicU64,
    uncached_fills: AtomicU64,
}

impl CacheCounters {
    fn tier(&self, tier: CacheTier) -> &TierCounters {
        match tier {
            CacheTier::Memory => &self.memory,
            CacheTier::Remote => &self.remote,
            CacheTier::Disk => &self.disk,
        }
    }

    pub(crate) fn record_hit(&self, tier: CacheTier, tombstone: bool) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
        if tombstone {
            self.tombstone_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_set(&self, tier: CacheTier) {
        self.tier(tier).sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, tier: CacheTier) {
        self.tier(tier).errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A fill ran under the stampede lock and its result was stored
    pub(crate) fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    /// A fill ran without the lock and its result was not stored
    pub(crate) fn record_uncached_fill(&self) {
        self.uncached_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        let tier = |tier: CacheTier| {
            let counters = self.tier(tier);
            TierStats {
                tier,
                hits: counters.hits.load(Ordering::Relaxed),
                sets: counters.sets.load(Ordering::Relaxed),
                errors: counters.errors.load(Ordering::Relaxed),
            }
        };
        let tiers = vec![
            tier(CacheTier::Memory),
            tier(CacheTier::Remote),
            tier(CacheTier::Disk),
        ];
        let hits = tiers.iter().map(|t| t.hits).sum::<u64>();
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            tombstone_hits: self.tombstone_hits.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            uncached_fills: self.uncached_fills.load(Ordering::Relaxed),
            tiers,
        }
    }

    pub(crate) fn reset(&self) {
        for tier in [&self.memory, &self.remote, &self.disk] {
            tier.hits.store(0, Ordering::Relaxed);
            tier.sets.store(0, Ordering::Relaxed);
            tier.errors.store(0, Ordering::Relaxed);
        }
        self.misses.store(0, Ordering::Relaxed);
        self.tombstone_hits.store(0, Ordering::Relaxed);
        self.fills.store(0, Ordering::Relaxed);
        self.uncached_fills.store(0, Ordering::Relaxed);
    }
}

/// Per-tier counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub sets: u64,
    pub errors: u64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_ratio: f64,
    pub tombstone_hits: u64,
    pub fills: u64,
    pub uncached_fills: u64,
    pub tiers: Vec<TierStats>,
}

impl CacheStats {
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}
