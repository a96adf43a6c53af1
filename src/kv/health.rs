//! Background health supervisor for key-value instances
//!
//! Pings every instance on a fixed cadence and publishes `BackendHealthChanged` when an
//! instance flips between healthy and unhealthy. Health is reported only through events
//! and [`BackendHealthSupervisor::snapshot`]; nothing else reads it to make decisions.

use super::provider::KvProvider;
use super::traits::KvStore;
use crate::config::ConfigHandle;
use crate::events::{EventPublisher, ResilienceEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Last known state of one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub backend: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Periodic PING loop over the configured instance set
#[derive(Debug)]
pub struct BackendHealthSupervisor {
    backends: RwLock<Arc<Vec<Arc<KvProvider>>>>,
    health: DashMap<String, BackendHealth>,
    config: ConfigHandle,
    events: Arc<EventPublisher>,
    running: AtomicBool,
    shutdown_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackendHealthSupervisor {
    pub fn new(
        backends: Vec<Arc<KvProvider>>,
        config: ConfigHandle,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            backends: RwLock::new(Arc::new(backends)),
            health: DashMap::new(),
            config,
            events,
            running: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Replace the supervised instance set
    pub fn set_backends(&self, backends: Vec<Arc<KvProvider>>) {
        let names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
        self.health.retain(|name, _| names.contains(name));
        *self.backends.write() = Arc::new(backends);
        info!(backends = ?names, "Health supervisor instance set replaced");
    }

    /// Ping every instance once and record the outcome
    pub async fn check_all(&self) -> Vec<BackendHealth> {
        let backends = self.backends.read().clone();
        let timeout = self.config.current().kv.command_timeout();

        let probes = backends.iter().map(|backend| async move {
            let result = match tokio::time::timeout(timeout, backend.ping()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("PING exceeded {:?}", timeout)),
            };
            (backend.name().to_string(), result)
        });

        let mut reports = Vec::with_capacity(backends.len());
        for (name, result) in join_all(probes).await {
            reports.push(self.record(name, result));
        }
        reports
    }

    fn record(&self, backend: String, result: Result<(), String>) -> BackendHealth {
        let now = Utc::now();
        let previous = self.health.get(&backend).map(|h| h.clone());

        let report = match &result {
            Ok(()) => BackendHealth {
                backend: backend.clone(),
                healthy: true,
                last_checked: now,
                last_error: None,
                consecutive_failures: 0,
            },
            Err(error) => BackendHealth {
                backend: backend.clone(),
                healthy: false,
                last_checked: now,
                last_error: Some(error.clone()),
                consecutive_failures: previous
                    .as_ref()
                    .map_or(1, |p| p.consecutive_failures + 1),
            },
        };

        // First observation of a healthy instance is not a change
        let flipped = match &previous {
            Some(p) => p.healthy != report.healthy,
            None => !report.healthy,
        };
        if flipped {
            if report.healthy {
                info!(backend = %backend, "KV backend recovered");
            } else {
                warn!(
                    backend = %backend,
                    error = report.last_error.as_deref().unwrap_or_default(),
                    "KV backend unhealthy"
                );
            }
            self.events.publish(ResilienceEvent::BackendHealthChanged {
                backend: backend.clone(),
                healthy: report.healthy,
                error: report.last_error.clone(),
            });
        }

        self.health.insert(backend, report.clone());
        report
    }

    /// Latest state of every instance
    pub fn snapshot(&self) -> Vec<BackendHealth> {
        let mut all: Vec<BackendHealth> = self.health.iter().map(|h| h.clone()).collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    /// Whether an instance answered its last probe
    pub fn is_healthy(&self, backend: &str) -> Option<bool> {
        self.health.get(backend).map(|h| h.healthy)
    }

    /// Start the background probe loop
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                if !supervisor.running.load(Ordering::Acquire) {
                    break;
                }
                supervisor.check_all().await;

                let interval = supervisor.config.current().kv.health_check_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {},
                    _ = supervisor.shutdown_notify.notified() => {
                        debug!("Health supervisor received shutdown notification");
                        break;
                    }
                }
            }
            debug!("Health supervisor loop ended");
        });
        *self.task.lock() = Some(handle);
        info!("KV health supervisor started");
    }

    /// Stop the background probe loop
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}
