//! Lock handles and acquisition options

use crate::kv::KvProvider;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Where a lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// SET-NX succeeded on a quorum of key-value instances
    Quorum,
    /// No instance was reachable; held in the process-local table
    Memory,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quorum => write!(f, "quorum"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Per-call overrides; unset fields fall back to `[lock]` configuration
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub retry_jitter: Option<Duration>,
    pub quorum: Option<usize>,
    pub auto_renew: bool,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_retry_jitter(mut self, retry_jitter: Duration) -> Self {
        self.retry_jitter = Some(retry_jitter);
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Keep extending the lease in the background until release
    pub fn auto_renew(mut self) -> Self {
        self.auto_renew = true;
        self
    }
}

#[derive(Debug)]
pub(crate) struct LockState {
    pub(crate) deadline: Mutex<Instant>,
    pub(crate) held_instances: Mutex<Vec<String>>,
    /// Instances the token was written to; release and renewal reach these even after a swap
    pub(crate) acquired_on: Vec<Arc<KvProvider>>,
    pub(crate) renewing: AtomicBool,
    pub(crate) released: AtomicBool,
    pub(crate) lost: watch::Sender<bool>,
}

/// A held lock
///
/// Cloning shares the same underlying state. The lock is not released on drop; call
/// [`LockManager::release`](super::LockManager::release) explicitly.
#[derive(Debug, Clone)]
pub struct Lock {
    pub(crate) resource: String,
    pub(crate) key: String,
    pub(crate) token: String,
    pub(crate) lease: Duration,
    pub(crate) mode: LockMode,
    pub(crate) quorum: usize,
    pub(crate) state: Arc<LockState>,
}

impl Lock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        resource: String,
        key: String,
        token: String,
        lease: Duration,
        mode: LockMode,
        quorum: usize,
        validity: Duration,
        held_instances: Vec<String>,
        acquired_on: Vec<Arc<KvProvider>>,
    ) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            resource,
            key,
            token,
            lease,
            mode,
            quorum,
            state: Arc::new(LockState {
                deadline: Mutex::new(Instant::now() + validity),
                held_instances: Mutex::new(held_instances),
                acquired_on,
                renewing: AtomicBool::new(false),
                released: AtomicBool::new(false),
                lost,
            }),
        }
    }

    /// Resource name as passed to `acquire`
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Backend key including the lock prefix
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque ownership token
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Instant after which the holder must assume the lock has expired
    pub fn validity_deadline(&self) -> Instant {
        *self.state.deadline.lock()
    }

    /// Remaining validity
    pub fn remaining(&self) -> Duration {
        self.validity_deadline()
            .saturating_duration_since(Instant::now())
    }

    /// Held, not lost, and inside the validity window
    pub fn is_valid(&self) -> bool {
        !self.is_released() && !self.is_lost() && self.validity_deadline() > Instant::now()
    }

    /// Instances that accepted the last acquire or renewal
    pub fn held_instances(&self) -> Vec<String> {
        self.state.held_instances.lock().clone()
    }

    pub fn is_renewing(&self) -> bool {
        self.state.renewing.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    pub fn is_lost(&self) -> bool {
        *self.state.lost.borrow()
    }

    /// Resolves once renewal fails to reach quorum; pending forever otherwise
    pub async fn lost(&self) {
        let mut receiver = self.state.lost.subscribe();
        // wait_for only errors when the sender is dropped, which cannot happen while self lives
        let _ = receiver.wait_for(|lost| *lost).await;
    }

    pub(crate) fn mark_lost(&self) {
        self.state.renewing.store(false, Ordering::Release);
        self.state.lost.send_replace(true);
    }

    pub(crate) fn extend(&self, validity: Duration, held_instances: Vec<String>) {
        *self.state.deadline.lock() = Instant::now() + validity;
        *self.state.held_instances.lock() = held_instances;
    }
}
