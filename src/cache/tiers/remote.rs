//! Remote tier on a shared key-value instance
//!
//! Records are stored as JSON with a PX expiry matching the record's remaining TTL.
//! Namespace clears list keys with SCAN and delete them in one batch.

use super::CacheStore;
use crate::cache::entry::{CacheRecord, CacheTier};
use crate::errors::ResilienceResult;
use crate::kv::{KvProvider, KvStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared key-value tier
#[derive(Debug, Clone)]
pub struct RemoteTier {
    backend: Arc<KvProvider>,
}

impl RemoteTier {
    pub fn new(backend: Arc<KvProvider>) -> Self {
        debug!(backend = %backend.name(), "Remote cache tier created");
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

impl CacheStore for RemoteTier {
    fn tier(&self) -> CacheTier {
        CacheTier::Remote
    }

    async fn get(&self, key: &str) -> ResilienceResult<Option<CacheRecord>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<CacheRecord>(&raw) {
            Ok(record) if record.is_expired() => Ok(None),
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = key, error = %e, "Discarding unreadable remote cache record");
                self.backend.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, record: &CacheRecord) -> ResilienceResult<()> {
        let ttl = record.remaining_ttl();
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Ok(());
        }
        let raw = serde_json::to_string(record)?;
        self.backend.set(&record.key, &raw, ttl).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> ResilienceResult<bool> {
        Ok(self.backend.delete(key).await?)
    }

    async fn clear_prefix(&self, prefix: &str) -> ResilienceResult<u64> {
        let keys = self.backend.keys(&format!("{}*", escape_glob(prefix))).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.backend.delete_many(&keys).await?)
    }
}

/// Escape glob metacharacters so a prefix matches literally
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
