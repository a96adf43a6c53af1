//! Lease renewal
//!
//! Renewal re-extends the lease with a token-checked PEXPIRE on every instance. If fewer
//! than `quorum` instances still recognize the token, or the renewed validity would
//! already be exhausted, the lock is marked lost, `LockLost` is published and the
//! surviving minority entries are removed. A lost lock is never extended again.
//!
//! Renewal targets the instances the lock was acquired on together with the current
//! instance set, so a hot-swapped instance list does not strand the token.

use super::manager::{bounded, remaining_validity, LockManager};
use super::types::{Lock, LockMode};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::ResilienceEvent;
use crate::kv::KvStore;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

impl LockManager {
    /// Extend a held lock once
    pub async fn renew(&self, lock: &Lock) -> ResilienceResult<Duration> {
        if lock.is_released() || lock.is_lost() {
            return Err(ResilienceError::LockLost {
                resource: lock.resource().to_string(),
            });
        }
        self.renew_once(lock).await.ok_or_else(|| ResilienceError::LockLost {
            resource: lock.resource().to_string(),
        })
    }

    /// One renewal round; `None` means the lock is now lost
    async fn renew_once(&self, lock: &Lock) -> Option<Duration> {
        let config = self.inner.config.current();
        let drift_factor = config.lock.drift_factor;

        let (renewed, validity) = match lock.mode() {
            LockMode::Memory => {
                let ok = self
                    .inner
                    .memory
                    .renew(lock.key(), lock.token(), lock.lease());
                let validity = remaining_validity(lock.lease(), Duration::ZERO, drift_factor);
                (
                    if ok { lock.held_instances() } else { Vec::new() },
                    validity,
                )
            }
            LockMode::Quorum => {
                let timeout = config.kv.command_timeout();
                let targets = self.lock_targets(lock);
                let started = Instant::now();
                let results = join_all(targets.iter().map(|backend| async move {
                    let outcome = bounded(
                        timeout,
                        backend.compare_and_expire(lock.key(), lock.token(), lock.lease()),
                    )
                    .await;
                    (backend.clone(), outcome)
                }))
                .await;

                let mut renewed = Vec::new();
                let mut survivors = Vec::new();
                for (backend, outcome) in results {
                    match outcome {
                        Ok(true) => {
                            renewed.push(backend.name().to_string());
                            survivors.push(backend);
                        }
                        Ok(false) => {}
                        Err(reason) => {
                            debug!(backend = %backend.name(), reason = %reason, "Renewal call failed");
                        }
                    }
                }

                let validity = remaining_validity(lock.lease(), started.elapsed(), drift_factor);
                // The local mirror follows the remote lease
                let kept = renewed.len() >= lock.quorum
                    && validity.is_some()
                    && self.inner.memory.hold(lock.key(), lock.token(), lock.lease());
                if !kept {
                    self.release_on(&survivors, lock.key(), lock.token(), timeout)
                        .await;
                }
                (renewed, validity.filter(|_| kept))
            }
        };

        match validity {
            Some(validity) if renewed.len() >= lock.quorum => {
                let instances = renewed.len();
                lock.extend(validity, renewed);
                debug!(
                    resource = %lock.resource(),
                    instances = instances,
                    validity_ms = validity.as_millis() as u64,
                    "Lock renewed"
                );
                self.inner.events.publish(ResilienceEvent::LockRenewed {
                    resource: lock.resource().to_string(),
                    instances,
                    validity_ms: validity.as_millis() as u64,
                });
                Some(validity)
            }
            _ => {
                self.inner.memory.release(lock.key(), lock.token());
                warn!(
                    resource = %lock.resource(),
                    instances = renewed.len(),
                    quorum = lock.quorum,
                    "Lock lost during renewal"
                );
                lock.mark_lost();
                self.inner.events.publish(ResilienceEvent::LockLost {
                    resource: lock.resource().to_string(),
                    instances: renewed.len(),
                    required: lock.quorum,
                });
                None
            }
        }
    }

    /// Start background renewal for `lock` on the configured cadence
    pub fn spawn_renewal(&self, lock: &Lock) {
        if lock.is_released() || lock.is_lost() || lock.is_renewing() {
            return;
        }

        let interval = self
            .inner
            .config
            .current()
            .lock
            .renewal_interval(lock.lease())
            .min(lock.lease() / 2)
            .max(Duration::from_millis(1));
        lock.state.renewing.store(true, Ordering::Release);

        let weak = Arc::downgrade(&self.inner);
        let renewing = lock.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if renewing.is_released() {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = LockManager { inner };
                if manager.renew_once(&renewing).await.is_none() {
                    manager.inner.renewals.remove(renewing.token());
                    break;
                }
            }
        });

        self.inner.renewals.insert(lock.token().to_string(), handle);
        debug!(
            resource = %lock.resource(),
            interval_ms = interval.as_millis() as u64,
            "Lock auto-renewal started"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ConfigHandle, ResilienceConfig};
    use crate::errors::ResilienceError;
    use crate::events::{EventPublisher, ResilienceEvent};
    use crate::kv::{KvProvider, KvStore, MemoryKvBackend};
    use crate::lock::{AcquireOptions, LockManager};
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> (LockManager, Vec<MemoryKvBackend>, Arc<EventPublisher>) {
        let memories: Vec<MemoryKvBackend> = (1..=3)
            .map(|i| MemoryKvBackend::new(format!("kv-{i}")))
            .collect();
        let events = Arc::new(EventPublisher::new(64));
        let manager = LockManager::new(
            memories
                .iter()
                .cloned()
                .map(|m| Arc::new(KvProvider::from(m)))
                .collect(),
            ConfigHandle::fixed(ResilienceConfig::for_testing()),
            events.clone(),
        );
        (manager, memories, events)
    }

    #[tokio::test]
    async fn test_manual_renew_extends_ttl() {
        let (manager, memories, _events) = manager();
        let lock = manager
            .acquire("report", Duration::from_millis(600), AcquireOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let validity = manager.renew(&lock).await.unwrap();
        assert!(validity > Duration::from_millis(500));
        assert!(memories[0].ttl("lock:report").unwrap() > Duration::from_millis(500));
        manager.release(&lock).await;
    }

    #[tokio::test]
    async fn test_auto_renew_keeps_lock_past_lease() {
        let (manager, memories, _events) = manager();
        let lock = manager
            .acquire(
                "report",
                Duration::from_millis(300),
                AcquireOptions::new().auto_renew(),
            )
            .await
            .unwrap();
        assert!(lock.is_renewing());
        assert_eq!(manager.active_renewals(), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(lock.is_valid());
        assert_eq!(
            memories[1].get("lock:report").await.unwrap().as_deref(),
            Some(lock.token())
        );

        assert!(manager.release(&lock).await);
        assert_eq!(manager.active_renewals(), 0);
        assert!(!lock.is_renewing());
    }

    #[tokio::test]
    async fn test_renewal_below_quorum_marks_lost() {
        let (manager, memories, events) = manager();
        let mut rx = events.subscribe();
        let lock = manager
            .acquire(
                "report",
                Duration::from_millis(300),
                AcquireOptions::new().auto_renew(),
            )
            .await
            .unwrap();

        memories[0].set_available(false);
        memories[1].set_available(false);

        tokio::time::timeout(Duration::from_secs(2), lock.lost())
            .await
            .expect("lock should be reported lost");
        assert!(!lock.is_valid());
        // The lone surviving instance no longer holds the token
        assert_eq!(memories[2].get("lock:report").await.unwrap(), None);

        let mut saw_lost = false;
        while let Ok(published) = rx.try_recv() {
            if matches!(published.event, ResilienceEvent::LockLost { required: 2, .. }) {
                saw_lost = true;
            }
        }
        assert!(saw_lost);

        let err = manager.renew(&lock).await.unwrap_err();
        assert!(matches!(err, ResilienceError::LockLost { .. }));
    }

    #[tokio::test]
    async fn test_close_stops_renewals() {
        let (manager, _memories, _events) = manager();
        let _lock = manager
            .acquire(
                "report",
                Duration::from_millis(300),
                AcquireOptions::new().auto_renew(),
            )
            .await
            .unwrap();
        manager.close().await;
        assert_eq!(manager.active_renewals(), 0);
    }
}
