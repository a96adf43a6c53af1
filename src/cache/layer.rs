//! # Tiered Cache Layer
//!
//! Reads walk the enabled tiers fastest first (memory, remote, disk). A hit in a lower
//! tier is copied into every tier above it with the same absolute expiry. Writes go to
//! every enabled tier with a jittered TTL.
//!
//! `get_or_fill` adds stampede protection on top of the read path: a full miss takes the
//! quorum lock for the namespaced key, re-checks the tiers, runs the fill and stores its
//! result (a tombstone when the fill found nothing). A caller that cannot get the lock
//! runs the fill itself and does not store the result.
//!
//! Tier failures never fail a read or write; they are logged, counted and, for the remote
//! tier, published as `BackendUnavailable`.

use super::entry::{CacheLookup, CacheRecord, CacheTier};
use super::jitter::jittered_ttl;
use super::stats::{CacheCounters, CacheStats};
use super::tiers::{CacheStore, DiskTier, MemoryTier, RemoteTier, TierBackend};
use crate::config::ConfigHandle;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::{EventPublisher, ResilienceEvent};
use crate::kv::{KvProvider, KvStore};
use crate::lock::{AcquireOptions, LockManager};
use crate::logging::log_cache_operation;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Multi-tier cache with stampede, penetration and avalanche protection
pub struct CacheLayer {
    tiers: Vec<TierBackend>,
    locks: Option<LockManager>,
    config: ConfigHandle,
    events: Arc<EventPublisher>,
    counters: CacheCounters,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("tiers", &self.tier_kinds())
            .field("stampede_lock", &self.locks.is_some())
            .finish()
    }
}

impl CacheLayer {
    /// Build a layer over explicit tiers, read in the order given
    pub fn new(
        tiers: Vec<TierBackend>,
        locks: Option<LockManager>,
        config: ConfigHandle,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            tiers,
            locks,
            config,
            events,
            counters: CacheCounters::default(),
        }
    }

    /// Build the tiers enabled in `[cache]`
    ///
    /// The remote tier uses `cache.remote.instance`, or the first configured instance.
    pub fn from_config(
        config: ConfigHandle,
        backends: &[Arc<KvProvider>],
        locks: Option<LockManager>,
        events: Arc<EventPublisher>,
    ) -> ResilienceResult<Self> {
        let cache = config.current().cache.clone();
        let mut tiers = Vec::new();

        if cache.memory.enabled {
            tiers.push(TierBackend::Memory(MemoryTier::new(cache.memory.max_entries)));
        }

        if cache.remote.enabled {
            let backend = match &cache.remote.instance {
                Some(name) => Some(
                    backends
                        .iter()
                        .find(|b| b.name() == name)
                        .ok_or_else(|| {
                            ResilienceError::ConfigInvalid(format!(
                                "cache.remote.instance '{}' is not a configured kv instance",
                                name
                            ))
                        })?,
                ),
                None => backends.first(),
            };
            match backend {
                Some(backend) => tiers.push(TierBackend::Remote(RemoteTier::new(backend.clone()))),
                None => warn!("Remote cache tier enabled but no kv instance is configured"),
            }
        }

        if cache.disk.enabled {
            tiers.push(TierBackend::Disk(DiskTier::new(cache.disk.directory.clone())));
        }

        let layer = Self::new(tiers, locks, config, events);
        info!(
            tiers = ?layer.tier_kinds(),
            stampede_lock = layer.locks.is_some(),
            "Cache layer initialized"
        );
        Ok(layer)
    }

    /// Enabled tiers in read order
    pub fn tier_kinds(&self) -> Vec<CacheTier> {
        self.tiers.iter().map(|t| t.tier()).collect()
    }

    /// Global switch from `cache.enabled`, read on every call
    pub fn is_enabled(&self) -> bool {
        self.config.current().cache.enabled
    }

    /// Namespaced key shared by every tier and by the stampede lock
    pub fn full_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}:{}", self.config.current().cache.key_prefix, namespace, key)
    }

    /// Read through the tiers
    pub async fn lookup(&self, namespace: &str, key: &str) -> ResilienceResult<CacheLookup> {
        if !self.is_enabled() {
            return Ok(CacheLookup::Miss);
        }

        let full_key = self.full_key(namespace, key);
        match self.find(&full_key).await {
            Some((record, tier)) => {
                let tombstone = record.is_tombstone();
                self.counters.record_hit(tier, tombstone);
                debug!(namespace = namespace, key = key, tier = %tier, tombstone = tombstone, "Cache hit");
                self.events.publish(ResilienceEvent::CacheHit {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    tier,
                    tombstone,
                });
                Ok(match record.value {
                    Some(value) => CacheLookup::Hit { value, tier },
                    None => CacheLookup::Tombstone { tier },
                })
            }
            None => {
                self.counters.record_miss();
                debug!(namespace = namespace, key = key, "Cache miss");
                self.events.publish(ResilienceEvent::CacheMiss {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Cached value; `None` for a miss or a tombstone
    pub async fn get(&self, namespace: &str, key: &str) -> ResilienceResult<Option<Value>> {
        Ok(self.lookup(namespace, key).await?.into_value())
    }

    /// Cached value, computing and storing it under the stampede lock on a miss
    ///
    /// `fill` returning `Ok(None)` stores a tombstone with the null TTL.
    pub async fn get_or_fill<F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        fill: F,
    ) -> ResilienceResult<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        let full_key = self.full_key(namespace, key);
        if !self.is_enabled() {
            return run_fill(&full_key, fill).await;
        }

        match self.lookup(namespace, key).await? {
            CacheLookup::Hit { value, .. } => return Ok(Some(value)),
            CacheLookup::Tombstone { .. } => return Ok(None),
            CacheLookup::Miss => {}
        }

        let Some(locks) = &self.locks else {
            let value = run_fill(&full_key, fill).await?;
            self.set(namespace, key, value.clone(), None).await?;
            self.counters.record_fill();
            return Ok(value);
        };

        let cache = self.config.current().cache.clone();
        let opts = AcquireOptions::new()
            .with_retry_count(cache.lock_retry_count)
            .with_retry_delay(cache.lock_retry_delay());

        let lock = match locks.acquire(&full_key, cache.lock_lease(), opts).await {
            Ok(lock) => lock,
            Err(e) => {
                debug!(key = %full_key, error = %e, "Stampede lock unavailable, filling without caching");
                self.counters.record_uncached_fill();
                return run_fill(&full_key, fill).await;
            }
        };

        let result = self.fill_locked(namespace, key, &full_key, fill).await;
        locks.release(&lock).await;
        result
    }

    async fn fill_locked<F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        full_key: &str,
        fill: F,
    ) -> ResilienceResult<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        // Another holder may have filled the key while we waited for the lock
        if let Some((record, _)) = self.find(full_key).await {
            return Ok(record.value);
        }

        let value = run_fill(full_key, fill).await?;
        self.set(namespace, key, value.clone(), None).await?;
        self.counters.record_fill();
        Ok(value)
    }

    /// Store `value` in every enabled tier; `None` stores a tombstone
    ///
    /// `ttl` of `None` uses the default TTL (null TTL for tombstones); `Some(ZERO)` never
    /// expires. Nonzero TTLs are jittered.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> ResilienceResult<()> {
        let config = self.config.current();
        if !config.cache.enabled {
            return Ok(());
        }

        let ttl = ttl.unwrap_or_else(|| {
            if value.is_none() {
                config.cache.null_ttl()
            } else {
                config.cache.default_ttl()
            }
        });
        let ttl = (!ttl.is_zero()).then(|| jittered_ttl(ttl, config.cache.ttl_jitter_factor));

        let record = CacheRecord::new(self.full_key(namespace, key), value, ttl);
        for tier in &self.tiers {
            match tier.put(&record).await {
                Ok(()) => self.counters.record_set(tier.tier()),
                Err(e) => self.tier_failed(tier, "set", &e),
            }
        }
        Ok(())
    }

    /// Serialize and store a typed value
    pub async fn set_json<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> ResilienceResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(namespace, key, Some(value), ttl).await
    }

    /// Read and deserialize a typed value
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> ResilienceResult<Option<T>> {
        match self.get(namespace, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Remove a key from every tier; true if any tier held it
    pub async fn delete(&self, namespace: &str, key: &str) -> ResilienceResult<bool> {
        let full_key = self.full_key(namespace, key);
        let mut removed = false;
        for tier in &self.tiers {
            match tier.remove(&full_key).await {
                Ok(found) => removed |= found,
                Err(e) => self.tier_failed(tier, "delete", &e),
            }
        }
        Ok(removed)
    }

    /// Remove every key of a namespace from every tier
    pub async fn clear_namespace(&self, namespace: &str) -> ResilienceResult<u64> {
        let prefix = format!("{}{}:", self.config.current().cache.key_prefix, namespace);
        let removed = self.clear_prefix(&prefix).await;
        log_cache_operation(
            "clear_namespace",
            namespace,
            None,
            "ok",
            Some(&format!("removed={removed}")),
        );
        Ok(removed)
    }

    /// Remove every cache key from every tier
    pub async fn clear_all(&self) -> ResilienceResult<u64> {
        let prefix = self.config.current().cache.key_prefix.clone();
        let removed = self.clear_prefix(&prefix).await;
        info!(removed = removed, "Cache cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    async fn clear_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.clear_prefix(prefix).await {
                Ok(count) => removed += count,
                Err(e) => self.tier_failed(tier, "clear", &e),
            }
        }
        removed
    }

    /// First live record in tier order, back-filling the tiers above it
    async fn find(&self, full_key: &str) -> Option<(CacheRecord, CacheTier)> {
        for (index, tier) in self.tiers.iter().enumerate() {
            let record = match tier.get(full_key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    self.tier_failed(tier, "get", &e);
                    continue;
                }
            };

            for upper in &self.tiers[..index] {
                if let Err(e) = upper.put(&record).await {
                    self.tier_failed(upper, "backfill", &e);
                }
            }
            return Some((record, tier.tier()));
        }
        None
    }

    fn tier_failed(&self, tier: &TierBackend, operation: &str, error: &ResilienceError) {
        self.counters.record_error(tier.tier());
        warn!(tier = %tier.tier(), operation = operation, error = %error, "Cache tier operation failed");

        if let TierBackend::Remote(remote) = tier {
            let (backend, reason) = match error {
                ResilienceError::BackendUnavailable { backend, reason } => {
                    (backend.clone(), reason.clone())
                }
                other => (remote.backend_name().to_string(), other.to_string()),
            };
            self.events.publish(ResilienceEvent::BackendUnavailable {
                backend,
                operation: format!("cache.{}", operation),
                reason,
            });
        }
    }
}

async fn run_fill<F, Fut>(full_key: &str, fill: F) -> ResilienceResult<Option<Value>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<Value>>>,
{
    fill().await.map_err(|e| ResilienceError::FallbackFailed {
        key: full_key.to_string(),
        message: e.to_string(),
    })
}
