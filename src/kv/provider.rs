//! Key-value provider dispatch
//!
//! Uses enum dispatch so that a mixed instance set (Redis in production, in-process
//! stores in tests and single-node deployments) can live in one `Vec`.

use super::errors::KvResult;
use super::providers::{MemoryKvBackend, RedisKvBackend};
use super::traits::KvStore;
use crate::config::{KvConfig, KvInstanceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One configured key-value instance
#[derive(Debug, Clone)]
pub enum KvProvider {
    /// Redis-compatible server (boxed to reduce enum size)
    Redis(Box<RedisKvBackend>),

    /// In-process store
    Memory(MemoryKvBackend),
}

impl KvProvider {
    /// Build the provider matching the instance url scheme
    pub fn from_config(instance: &KvInstanceConfig, kv: &KvConfig) -> KvResult<Self> {
        if instance.url.starts_with("memory://") {
            info!(backend = %instance.name, "In-process KV provider created");
            Ok(Self::Memory(MemoryKvBackend::new(&instance.name)))
        } else {
            Ok(Self::Redis(Box::new(RedisKvBackend::from_config(
                instance, kv,
            )?)))
        }
    }

    /// Build every configured instance
    pub fn from_kv_config(kv: &KvConfig) -> KvResult<Vec<Arc<Self>>> {
        kv.instances
            .iter()
            .map(|instance| Self::from_config(instance, kv).map(Arc::new))
            .collect()
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }

    /// Access the in-process store, if this is one
    pub fn as_memory(&self) -> Option<&MemoryKvBackend> {
        match self {
            Self::Memory(m) => Some(m),
            Self::Redis(_) => None,
        }
    }
}

impl From<MemoryKvBackend> for KvProvider {
    fn from(backend: MemoryKvBackend) -> Self {
        Self::Memory(backend)
    }
}

impl From<RedisKvBackend> for KvProvider {
    fn from(backend: RedisKvBackend) -> Self {
        Self::Redis(Box::new(backend))
    }
}

impl KvStore for KvProvider {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        match self {
            Self::Redis(s) => s.get(key).await,
            Self::Memory(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        match self {
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::Memory(s) => s.set(key, value, ttl).await,
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        match self {
            Self::Redis(s) => s.set_nx(key, value, ttl).await,
            Self::Memory(s) => s.set_nx(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        match self {
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        match self {
            Self::Redis(s) => s.expire(key, ttl).await,
            Self::Memory(s) => s.expire(key, ttl).await,
        }
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        match self {
            Self::Redis(s) => s.keys(pattern).await,
            Self::Memory(s) => s.keys(pattern).await,
        }
    }

    async fn delete_many(&self, keys: &[String]) -> KvResult<u64> {
        match self {
            Self::Redis(s) => s.delete_many(keys).await,
            Self::Memory(s) => s.delete_many(keys).await,
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        match self {
            Self::Redis(s) => s.compare_and_delete(key, expected).await,
            Self::Memory(s) => s.compare_and_delete(key, expected).await,
        }
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        match self {
            Self::Redis(s) => s.compare_and_expire(key, expected, ttl).await,
            Self::Memory(s) => s.compare_and_expire(key, expected, ttl).await,
        }
    }

    async fn ping(&self) -> KvResult<()> {
        match self {
            Self::Redis(s) => s.ping().await,
            Self::Memory(s) => s.ping().await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Redis(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selects_provider() {
        let kv = KvConfig::default();
        let memory = KvProvider::from_config(
            &KvInstanceConfig {
                name: "m".to_string(),
                url: "memory://m".to_string(),
            },
            &kv,
        )
        .unwrap();
        assert_eq!(memory.provider_name(), "memory");
        assert_eq!(memory.name(), "m");

        let redis = KvProvider::from_config(
            &KvInstanceConfig {
                name: "r".to_string(),
                url: "redis://127.0.0.1:6379".to_string(),
            },
            &kv,
        )
        .unwrap();
        assert_eq!(redis.provider_name(), "redis");
        assert!(redis.as_memory().is_none());
    }
}
