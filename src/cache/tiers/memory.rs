//! In-process tier using Moka
//!
//! Each record carries its own expiry, so the cache is built with a per-entry
//! [`moka::Expiry`] rather than a cache-wide TTL.

use super::CacheStore;
use crate::cache::entry::{CacheRecord, CacheTier};
use crate::errors::ResilienceResult;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::debug;

struct RecordExpiry;

impl Expiry<String, CacheRecord> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheRecord,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.remaining_ttl()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheRecord,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining_ttl()
    }
}

/// Process-memory tier
#[derive(Clone)]
pub struct MemoryTier {
    cache: moka::future::Cache<String, CacheRecord>,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("max_capacity", &self.cache.policy().max_capacity())
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryTier {
    pub fn new(max_entries: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_entries)
            .expire_after(RecordExpiry)
            .build();

        debug!(max_entries = max_entries, "Memory cache tier created");
        Self { cache }
    }

    /// Approximate number of records
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush pending maintenance so counts are exact
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl CacheStore for MemoryTier {
    fn tier(&self) -> CacheTier {
        CacheTier::Memory
    }

    async fn get(&self, key: &str) -> ResilienceResult<Option<CacheRecord>> {
        match self.cache.get(key).await {
            Some(record) if record.is_expired() => {
                self.cache.invalidate(key).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, record: &CacheRecord) -> ResilienceResult<()> {
        if record.is_expired() {
            return Ok(());
        }
        self.cache.insert(record.key.clone(), record.clone()).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> ResilienceResult<bool> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn clear_prefix(&self, prefix: &str) -> ResilienceResult<u64> {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &keys {
            self.cache.invalidate(key).await;
        }
        Ok(keys.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_remove() {
        let tier = MemoryTier::new(100);
        let record = CacheRecord::new("cache:ns:a", Some(json!(1)), Some(Duration::from_secs(60)));
        tier.put(&record).await.unwrap();
        assert_eq!(tier.get("cache:ns:a").await.unwrap(), Some(record));
        assert!(tier.remove("cache:ns:a").await.unwrap());
        assert_eq!(tier.get("cache:ns:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_per_record_expiry() {
        let tier = MemoryTier::new(100);
        let short = CacheRecord::new(
            "cache:ns:short",
            Some(json!(1)),
            Some(Duration::from_millis(50)),
        );
        let long = CacheRecord::new("cache:ns:long", Some(json!(2)), Some(Duration::from_secs(60)));
        tier.put(&short).await.unwrap();
        tier.put(&long).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(tier.get("cache:ns:short").await.unwrap(), None);
        assert!(tier.get("cache:ns:long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_prefix_only_touches_namespace() {
        let tier = MemoryTier::new(100);
        for key in ["cache:a:1", "cache:a:2", "cache:b:1"] {
            tier.put(&CacheRecord::new(key, Some(json!(key)), None))
                .await
                .unwrap();
        }
        tier.run_pending_tasks().await;
        assert_eq!(tier.clear_prefix("cache:a:").await.unwrap(), 2);
        assert!(tier.get("cache:a:1").await.unwrap().is_none());
        assert!(tier.get("cache:b:1").await.unwrap().is_some());
    }
}
