//! In-process key-value provider
//!
//! Gives single-process deployments and tests a store with the same token and expiry
//! semantics as Redis. Availability can be toggled to simulate an outage.

use crate::kv::errors::{KvError, KvResult};
use crate::kv::traits::KvStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Key-value store held in process memory
#[derive(Debug, Clone)]
pub struct MemoryKvBackend {
    name: String,
    entries: Arc<DashMap<String, StoredValue>>,
    available: Arc<AtomicBool>,
}

impl MemoryKvBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the instance reachable or unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(backend = %self.name, available = available, "Memory KV availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it exists and expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn check_available(&self) -> KvResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(KvError::unavailable(&self.name, "instance marked down"))
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let (value, expired) = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
        }
        value
    }
}

impl KvStore for MemoryKvBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check_available()?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(stored);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> KvResult<u64> {
        self.check_available()?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, v)| v.is_live(now))
            .count() as u64)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> KvResult<()> {
        self.check_available()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Redis-style glob matching supporting `*`, `?` and `\\` escapes
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
                continue;
            }
            Some('\\') if p.get(pi + 1) == Some(&t[ti]) => 2,
            Some('?') => 1,
            Some(c) if *c != '\\' && *c == t[ti] => 1,
            _ => 0,
        };

        if step > 0 {
            pi += step;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while p.get(pi) == Some(&'*') {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("cache:holidays:*", "cache:holidays:2025"));
        assert!(!glob_match("cache:holidays:*", "cache:lunar:2025"));
        assert!(glob_match("lock:?", "lock:a"));
        assert!(!glob_match("lock:?", "lock:ab"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(glob_match("*a", "*ba"));
        assert!(glob_match("cache:a\\*b:*", "cache:a*b:1"));
        assert!(!glob_match("cache:a\\*b:*", "cache:aXb:1"));
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing_key() {
        let kv = MemoryKvBackend::new("kv-test");
        assert!(kv.set_nx("lock:a", "t1", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx("lock:a", "t2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("lock:a").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_reacquirable() {
        let kv = MemoryKvBackend::new("kv-test");
        assert!(kv.set_nx("lock:a", "t1", Duration::from_millis(100)).await.unwrap());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(kv.get("lock:a").await.unwrap(), None);
        assert!(kv.set_nx("lock:a", "t2", Duration::from_millis(100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_token() {
        let kv = MemoryKvBackend::new("kv-test");
        kv.set("lock:a", "mine", Some(Duration::from_secs(5))).await.unwrap();
        assert!(!kv.compare_and_delete("lock:a", "theirs").await.unwrap());
        assert!(kv.compare_and_delete("lock:a", "mine").await.unwrap());
        assert_eq!(kv.get("lock:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_expire_extends_only_matching_token() {
        let kv = MemoryKvBackend::new("kv-test");
        kv.set("lock:a", "mine", Some(Duration::from_secs(1))).await.unwrap();
        assert!(!kv
            .compare_and_expire("lock:a", "theirs", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(kv
            .compare_and_expire("lock:a", "mine", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(kv.ttl("lock:a").unwrap() > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unavailable_backend_rejects_operations() {
        let kv = MemoryKvBackend::new("kv-down");
        kv.set_available(false);
        let err = kv.ping().await.unwrap_err();
        assert!(matches!(err, KvError::Unavailable { .. }));
        assert!(kv.get("any").await.is_err());
        kv.set_available(true);
        assert!(kv.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_keys_and_delete_many() {
        let kv = MemoryKvBackend::new("kv-test");
        for k in ["cache:a:1", "cache:a:2", "cache:b:1"] {
            kv.set(k, "v", None).await.unwrap();
        }
        let mut keys = kv.keys("cache:a:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a:1".to_string(), "cache:a:2".to_string()]);
        assert_eq!(kv.delete_many(&keys).await.unwrap(), 2);
        assert_eq!(kv.len(), 1);
    }
}
