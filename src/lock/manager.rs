//! # Quorum Lock Manager
//!
//! Redlock-style mutual exclusion across independent key-value instances.
//!
//! An acquisition writes a random token with `SET NX PX lease` to every instance in
//! parallel. It succeeds only when at least `quorum` instances accepted the token and the
//! remaining validity `lease - elapsed - drift` is still positive, where
//! `drift = lease * drift_factor + 2ms`. Any partial acquisition is rolled back with a
//! token-checked delete before the attempt is retried or reported as `QuorumNotMet`.
//!
//! When *no* instance is reachable and `fallback_to_memory` is enabled, the lock is taken
//! in a process-local table instead. Such a lock only excludes holders in this process.
//! Quorum locks are mirrored into the same table so that a fallback acquisition never
//! overlaps a quorum holder in this process.

use super::memory::MemoryLockTable;
use super::types::{AcquireOptions, Lock, LockMode};
use crate::config::{ConfigHandle, ResilienceConfig};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::{EventPublisher, ResilienceEvent};
use crate::kv::{KvProvider, KvStore};
use crate::logging::log_lock_operation;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MEMORY_INSTANCE: &str = "memory";

/// Quorum lock manager
///
/// Cheap to clone; clones share backends, the fallback table and renewal tasks.
#[derive(Clone)]
pub struct LockManager {
    pub(crate) inner: Arc<LockManagerInner>,
}

pub(crate) struct LockManagerInner {
    backends: RwLock<Arc<Vec<Arc<KvProvider>>>>,
    pub(crate) memory: MemoryLockTable,
    pub(crate) config: ConfigHandle,
    pub(crate) events: Arc<EventPublisher>,
    pub(crate) renewals: DashMap<String, JoinHandle<()>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backends", &self.backend_names())
            .field("memory_leases", &self.inner.memory.len())
            .field("active_renewals", &self.inner.renewals.len())
            .finish()
    }
}

impl LockManager {
    pub fn new(
        backends: Vec<Arc<KvProvider>>,
        config: ConfigHandle,
        events: Arc<EventPublisher>,
    ) -> Self {
        info!(
            backends = backends.len(),
            quorum = config.current().lock.quorum_for(backends.len()),
            "Lock manager initialized"
        );
        Self {
            inner: Arc::new(LockManagerInner {
                backends: RwLock::new(Arc::new(backends)),
                memory: MemoryLockTable::new(),
                config,
                events,
                renewals: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Current instance set
    pub fn backends(&self) -> Arc<Vec<Arc<KvProvider>>> {
        self.inner.backends.read().clone()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends().iter().map(|b| b.name().to_string()).collect()
    }

    /// Replace the instance set; held locks keep their original instances until renewal
    pub fn set_backends(&self, backends: Vec<Arc<KvProvider>>) {
        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        info!(backends = ?names, "Lock manager instance set replaced");
        *self.inner.backends.write() = Arc::new(backends);
    }

    /// Acquire `resource` for `lease`
    pub async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
        opts: AcquireOptions,
    ) -> ResilienceResult<Lock> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ResilienceError::ShuttingDown("lock manager".to_string()));
        }
        if lease.is_zero() {
            return Err(ResilienceError::ConfigInvalid(
                "lock lease must be greater than 0".to_string(),
            ));
        }

        let config = self.inner.config.current();
        let instances = self.backends().len();
        if let Some(quorum) = opts.quorum {
            if quorum == 0 || (instances > 0 && quorum > instances) {
                return Err(ResilienceError::ConfigInvalid(format!(
                    "quorum {} is outside 1..={} for lock '{}'",
                    quorum, instances, resource
                )));
            }
        }

        let retry_count = opts.retry_count.unwrap_or(config.lock.retry_count);
        let retry_delay = opts.retry_delay.unwrap_or_else(|| config.lock.retry_delay());
        let retry_jitter = opts
            .retry_jitter
            .unwrap_or_else(|| config.lock.retry_jitter());
        let key = format!("{}{}", config.lock.key_prefix, resource);

        let mut last_error = None;
        for attempt in 0..=retry_count {
            if attempt > 0 {
                tokio::time::sleep(retry_delay + random_jitter(retry_jitter)).await;
            }

            match self
                .attempt_acquire(resource, &key, lease, &opts, &config)
                .await
            {
                Ok(lock) => {
                    if opts.auto_renew {
                        self.spawn_renewal(&lock);
                    }
                    return Ok(lock);
                }
                Err(e) => {
                    debug!(
                        resource = %resource,
                        attempt = attempt + 1,
                        max_attempts = retry_count + 1,
                        error = %e,
                        "Lock attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ResilienceError::QuorumNotMet {
            resource: resource.to_string(),
            acquired: 0,
            required: config.lock.quorum_for(instances),
        });
        debug!(resource = %resource, error = %error, "Lock acquisition gave up");
        Err(error)
    }

    async fn attempt_acquire(
        &self,
        resource: &str,
        key: &str,
        lease: Duration,
        opts: &AcquireOptions,
        config: &ResilienceConfig,
    ) -> ResilienceResult<Lock> {
        let backends = self.backends();
        let token = Uuid::new_v4().simple().to_string();

        if backends.is_empty() {
            return self.acquire_in_memory(
                resource,
                key,
                token,
                lease,
                config,
                "no kv instances configured",
            );
        }

        let quorum = opts
            .quorum
            .unwrap_or_else(|| config.lock.quorum_for(backends.len()));

        // Local leases (fallback or mirrored quorum) exclude acquirers in this process
        if self.inner.memory.is_held(key) {
            return Err(ResilienceError::QuorumNotMet {
                resource: resource.to_string(),
                acquired: 0,
                required: quorum,
            });
        }

        let command_timeout = config.kv.command_timeout();
        let started = Instant::now();
        let outcomes = join_all(backends.iter().map(|backend| {
            let token = token.as_str();
            async move {
                let outcome =
                    bounded(command_timeout, backend.set_nx(key, token, lease)).await;
                (backend.clone(), outcome)
            }
        }))
        .await;

        let mut acquired = Vec::new();
        let mut reachable = 0usize;
        for (backend, outcome) in outcomes {
            match outcome {
                Ok(true) => {
                    reachable += 1;
                    acquired.push(backend);
                }
                Ok(false) => reachable += 1,
                Err(reason) => {
                    debug!(backend = %backend.name(), reason = %reason, "SET NX failed");
                    self.inner.events.publish(ResilienceEvent::BackendUnavailable {
                        backend: backend.name().to_string(),
                        operation: "lock.acquire".to_string(),
                        reason,
                    });
                }
            }
        }

        if reachable == 0 {
            return self.acquire_in_memory(
                resource,
                key,
                token,
                lease,
                config,
                "no kv instance reachable",
            );
        }

        let elapsed = started.elapsed();
        let validity = remaining_validity(lease, elapsed, config.lock.drift_factor);
        match validity {
            Some(validity)
                if acquired.len() >= quorum && self.inner.memory.hold(key, &token, lease) =>
            {
                let held: Vec<String> = acquired.iter().map(|b| b.name().to_string()).collect();
                log_lock_operation(
                    "acquire",
                    resource,
                    Some(held.len()),
                    "acquired",
                    Some(&format!(
                        "quorum={quorum} validity_ms={}",
                        validity.as_millis()
                    )),
                );
                self.inner.events.publish(ResilienceEvent::LockAcquired {
                    resource: resource.to_string(),
                    mode: LockMode::Quorum,
                    instances: held.len(),
                    validity_ms: validity.as_millis() as u64,
                });
                Ok(Lock::new(
                    resource.to_string(),
                    key.to_string(),
                    token,
                    lease,
                    LockMode::Quorum,
                    quorum,
                    validity,
                    held,
                    acquired,
                ))
            }
            _ => {
                self.release_on(&acquired, key, &token, command_timeout)
                    .await;
                Err(ResilienceError::QuorumNotMet {
                    resource: resource.to_string(),
                    acquired: acquired.len(),
                    required: quorum,
                })
            }
        }
    }

    fn acquire_in_memory(
        &self,
        resource: &str,
        key: &str,
        token: String,
        lease: Duration,
        config: &ResilienceConfig,
        reason: &str,
    ) -> ResilienceResult<Lock> {
        if !config.lock.fallback_to_memory {
            return Err(ResilienceError::BackendUnavailable {
                backend: "lock quorum".to_string(),
                reason: reason.to_string(),
            });
        }

        if !self.inner.memory.try_acquire(key, &token, lease) {
            return Err(ResilienceError::QuorumNotMet {
                resource: resource.to_string(),
                acquired: 0,
                required: 1,
            });
        }

        let validity = remaining_validity(lease, Duration::ZERO, config.lock.drift_factor)
            .unwrap_or(lease);
        warn!(
            resource = %resource,
            reason = %reason,
            "Lock acquired in process memory; exclusivity limited to this process"
        );
        self.inner.events.publish(ResilienceEvent::LockAcquired {
            resource: resource.to_string(),
            mode: LockMode::Memory,
            instances: 1,
            validity_ms: validity.as_millis() as u64,
        });
        Ok(Lock::new(
            resource.to_string(),
            key.to_string(),
            token,
            lease,
            LockMode::Memory,
            1,
            validity,
            vec![MEMORY_INSTANCE.to_string()],
            Vec::new(),
        ))
    }

    /// Instances the lock was acquired on, plus any instance added since
    pub(crate) fn lock_targets(&self, lock: &Lock) -> Vec<Arc<KvProvider>> {
        let mut targets = lock.state.acquired_on.clone();
        for backend in self.backends().iter() {
            if !targets.iter().any(|held| Arc::ptr_eq(held, backend)) {
                targets.push(backend.clone());
            }
        }
        targets
    }

    /// Token-checked delete on the given instances, ignoring individual failures
    pub(crate) async fn release_on(
        &self,
        backends: &[Arc<KvProvider>],
        key: &str,
        token: &str,
        command_timeout: Duration,
    ) -> usize {
        let results = join_all(
            backends
                .iter()
                .map(|backend| bounded(command_timeout, backend.compare_and_delete(key, token))),
        )
        .await;
        results.into_iter().filter(|r| matches!(r, Ok(true))).count()
    }

    /// Release a lock; returns whether this holder still owned it on a quorum
    pub async fn release(&self, lock: &Lock) -> bool {
        if lock.state.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock.state.renewing.store(false, Ordering::Release);
        if let Some((_, handle)) = self.inner.renewals.remove(lock.token()) {
            handle.abort();
        }

        let released = match lock.mode {
            LockMode::Memory => usize::from(self.inner.memory.release(lock.key(), lock.token())),
            LockMode::Quorum => {
                self.inner.memory.release(lock.key(), lock.token());
                let timeout = self.inner.config.current().kv.command_timeout();
                let targets = self.lock_targets(lock);
                self.release_on(&targets, lock.key(), lock.token(), timeout)
                    .await
            }
        };

        let owned = released >= lock.quorum;
        debug!(
            resource = %lock.resource(),
            mode = %lock.mode(),
            instances = released,
            owned = owned,
            "Lock released"
        );
        self.inner.events.publish(ResilienceEvent::LockReleased {
            resource: lock.resource().to_string(),
            instances: released,
        });
        owned
    }

    /// Acquire, run `f`, and always release
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        lease: Duration,
        opts: AcquireOptions,
        f: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.acquire(resource, lease, opts).await?;
        let output = f(lock.clone()).await;
        self.release(&lock).await;
        Ok(output)
    }

    /// Whether a quorum of instances (or the fallback table) currently holds `resource`
    pub async fn is_locked(&self, resource: &str) -> bool {
        let config = self.inner.config.current();
        let key = format!("{}{}", config.lock.key_prefix, resource);
        if self.inner.memory.is_held(&key) {
            return true;
        }

        let backends = self.backends();
        if backends.is_empty() {
            return false;
        }
        let timeout = config.kv.command_timeout();
        let held = join_all(
            backends
                .iter()
                .map(|backend| bounded(timeout, backend.get(&key))),
        )
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Some(_))))
        .count();
        held >= config.lock.quorum_for(backends.len())
    }

    /// Number of locks with a live renewal task
    pub fn active_renewals(&self) -> usize {
        self.inner.renewals.len()
    }

    /// Drop expired local leases now; acquisitions also sweep periodically
    pub fn purge_expired(&self) -> usize {
        self.inner.memory.purge_expired()
    }

    /// Stop all renewal tasks; further acquisitions fail with `ShuttingDown`
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let tokens: Vec<String> = self
            .inner
            .renewals
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for token in tokens {
            if let Some((_, handle)) = self.inner.renewals.remove(&token) {
                handle.abort();
            }
        }
        info!("Lock manager closed");
    }
}

/// Lease left after network time and clock drift, or `None` if nothing remains
pub(crate) fn remaining_validity(
    lease: Duration,
    elapsed: Duration,
    drift_factor: f64,
) -> Option<Duration> {
    let drift = lease.mul_f64(drift_factor) + Duration::from_millis(2);
    lease
        .checked_sub(elapsed)
        .and_then(|left| left.checked_sub(drift))
        .filter(|left| !left.is_zero())
}

/// Uniform random delay in `[0, max]`
pub(crate) fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }
}

/// Run a backend call under the command timeout, flattening failures to a reason string
pub(crate) async fn bounded<T, E, F>(timeout: Duration, fut: F) -> Result<T, String>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {:?}", timeout)),
    }
}
