//! Process-local lock table
//!
//! Holds the leases taken when no key-value instance is reachable, and mirrors every
//! quorum lock this process holds so a fallback acquisition cannot overlap it. Same
//! token and expiry semantics as the quorum path, but exclusivity only holds within
//! this process.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between opportunistic sweeps of expired leases
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct MemoryLease {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub(crate) struct MemoryLockTable {
    leases: DashMap<String, MemoryLease>,
    last_purge: Mutex<Instant>,
}

impl Default for MemoryLockTable {
    fn default() -> Self {
        Self {
            leases: DashMap::new(),
            last_purge: Mutex::new(Instant::now()),
        }
    }
}

impl MemoryLockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> bool {
        self.maybe_purge();
        let now = Instant::now();
        let fresh = MemoryLease {
            token: token.to_string(),
            expires_at: now + lease,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    /// Whether an unexpired lease exists for `key`
    pub(crate) fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.leases
            .get(key)
            .map_or(false, |lease| lease.expires_at > now)
    }

    /// Record or extend a lease owned by `token`; refuses only if another token holds a live lease
    pub(crate) fn hold(&self, key: &str, token: &str, lease: Duration) -> bool {
        self.maybe_purge();
        let now = Instant::now();
        let fresh = MemoryLease {
            token: token.to_string(),
            expires_at: now + lease,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.token != token && current.expires_at > now {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    pub(crate) fn renew(&self, key: &str, token: &str, lease: Duration) -> bool {
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut held) if held.token == token && held.expires_at > now => {
                held.expires_at = now + lease;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn release(&self, key: &str, token: &str) -> bool {
        let now = Instant::now();
        self.leases
            .remove_if(key, |_, held| held.token == token && held.expires_at > now)
            .is_some()
    }

    /// Drop expired leases
    pub(crate) fn purge_expired(&self) -> usize {
        let now = Instant::now();
        *self.last_purge.lock() = now;
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.expires_at > now);
        before.saturating_sub(self.leases.len())
    }

    /// Sweep at most once per `PURGE_INTERVAL`; must not run while holding a map entry
    fn maybe_purge(&self) {
        let due = {
            let last = self.last_purge.lock();
            last.elapsed() >= PURGE_INTERVAL
        };
        if due {
            self.purge_expired();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_released() {
        let table = MemoryLockTable::new();
        assert!(table.try_acquire("lock:a", "t1", Duration::from_secs(5)));
        assert!(!table.try_acquire("lock:a", "t2", Duration::from_secs(5)));
        assert!(!table.release("lock:a", "t2"));
        assert!(table.release("lock:a", "t1"));
        assert!(table.try_acquire("lock:a", "t2", Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_replaced() {
        let table = MemoryLockTable::new();
        assert!(table.try_acquire("lock:a", "t1", Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!table.is_held("lock:a"));
        assert!(!table.renew("lock:a", "t1", Duration::from_millis(50)));
        assert!(table.try_acquire("lock:a", "t2", Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let table = MemoryLockTable::new();
        table.try_acquire("lock:a", "t1", Duration::from_millis(10));
        table.try_acquire("lock:b", "t1", Duration::from_secs(10));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(table.purge_expired(), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sweeps_stale_leases_periodically() {
        let table = MemoryLockTable::new();
        for i in 0..10 {
            table.try_acquire(&format!("lock:stale-{i}"), "t1", Duration::from_millis(10));
        }
        tokio::time::advance(Duration::from_millis(20)).await;
        table.try_acquire("lock:fresh", "t1", Duration::from_secs(60));
        assert_eq!(table.len(), 11);

        tokio::time::advance(PURGE_INTERVAL).await;
        table.try_acquire("lock:other", "t1", Duration::from_secs(60));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_hold_extends_own_lease_but_not_foreign() {
        let table = MemoryLockTable::new();
        assert!(table.hold("lock:a", "t1", Duration::from_secs(5)));
        assert!(table.hold("lock:a", "t1", Duration::from_secs(5)));
        assert!(!table.hold("lock:a", "t2", Duration::from_secs(5)));
        assert!(!table.try_acquire("lock:a", "t2", Duration::from_secs(5)));
        assert!(table.release("lock:a", "t1"));
        assert!(table.hold("lock:a", "t2", Duration::from_secs(5)));
    }
}
