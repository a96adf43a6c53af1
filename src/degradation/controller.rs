//! # Degradation Controller
//!
//! Samples load on a fixed cadence, runs the samples through the hysteresis
//! [`StateMachine`] and, on every transition, recomputes which registered services run
//! their fallback. Callers go through [`DegradationController::execute_service`], which
//! dispatches to the primary or fallback implementation per call.
//!
//! A service is degraded when the policy table sheds its priority in the current state
//! *or* an operator degraded it manually. Manual overrides survive state transitions and
//! are the only way to degrade a Critical service.

use super::signals::{LoadSample, LoadSampler, RequestMetrics, SystemLoadSampler};
use super::state::{classify, degraded_by_policy, ServicePriority, StateMachine, SystemState};
use crate::config::ConfigHandle;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::{EventPublisher, ResilienceEvent};
use crate::logging::log_state_transition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One implementation of a service, primary or fallback
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

/// Adapter running a closure as a [`ServiceHandler`]
pub struct FnServiceHandler<F> {
    f: F,
}

/// Wrap `f` as a service implementation
pub fn service_fn<F, Fut>(f: F) -> FnServiceHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnServiceHandler { f }
}

#[async_trait]
impl<F, Fut> ServiceHandler for FnServiceHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.f)(args).await
    }
}

struct ServiceEntry {
    priority: ServicePriority,
    primary: Arc<dyn ServiceHandler>,
    fallback: Option<Arc<dyn ServiceHandler>>,
    manual: bool,
    policy: bool,
}

impl ServiceEntry {
    fn degraded(&self) -> bool {
        self.manual || self.policy
    }
}

/// Operator view of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceState {
    pub name: String,
    pub priority: ServicePriority,
    pub degraded: bool,
    pub manual_override: bool,
    pub has_fallback: bool,
}

/// Operator view of the state machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStateSnapshot {
    pub state: SystemState,
    pub last_transition_at: DateTime<Utc>,
    pub consecutive_healthy_checks: u32,
    pub degraded_services: Vec<String>,
    pub total_services: usize,
}

/// Load-adaptive service degradation
#[derive(Clone)]
pub struct DegradationController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ConfigHandle,
    events: Arc<EventPublisher>,
    sampler: Arc<dyn LoadSampler>,
    requests: Arc<RequestMetrics>,
    machine: Mutex<StateMachine>,
    services: RwLock<HashMap<String, ServiceEntry>>,
    running: AtomicBool,
    shutdown_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("state", &self.current_state())
            .field("services", &self.inner.services.read().len())
            .finish()
    }
}

impl DegradationController {
    pub fn new(
        config: ConfigHandle,
        events: Arc<EventPublisher>,
        sampler: Arc<dyn LoadSampler>,
        requests: Arc<RequestMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                events,
                sampler,
                requests,
                machine: Mutex::new(StateMachine::new()),
                services: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Controller sampling host CPU/memory and its own request metrics
    pub fn with_system_sampler(config: ConfigHandle, events: Arc<EventPublisher>) -> Self {
        let requests = Arc::new(RequestMetrics::default());
        let sampler = Arc::new(SystemLoadSampler::new(requests.clone()));
        Self::new(config, events, sampler, requests)
    }

    /// Register or replace a service
    pub fn register_service(
        &self,
        name: impl Into<String>,
        priority: ServicePriority,
        primary: Arc<dyn ServiceHandler>,
        fallback: Option<Arc<dyn ServiceHandler>>,
    ) {
        let name = name.into();
        let state = self.current_state();
        let entry = ServiceEntry {
            priority,
            primary,
            fallback,
            manual: false,
            policy: degraded_by_policy(state, priority),
        };
        let degraded = entry.degraded();

        if self.inner.services.write().insert(name.clone(), entry).is_some() {
            warn!(service = %name, "Service re-registered, previous registration replaced");
        }
        info!(service = %name, priority = %priority, degraded = degraded, "Service registered");
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        self.inner.services.write().remove(name).is_some()
    }

    /// Run a service through its primary implementation, or its fallback when degraded
    pub async fn execute_service(&self, name: &str, args: Value) -> ResilienceResult<Value> {
        let (handler, degraded) = {
            let services = self.inner.services.read();
            let entry = services
                .get(name)
                .ok_or_else(|| ResilienceError::ServiceNotFound(name.to_string()))?;
            if entry.degraded() {
                let fallback = entry
                    .fallback
                    .clone()
                    .ok_or_else(|| ResilienceError::ServiceUnavailable(name.to_string()))?;
                (fallback, true)
            } else {
                (entry.primary.clone(), false)
            }
        };

        let started = Instant::now();
        let result = handler.call(args).await;
        self.inner.requests.record(started.elapsed(), result.is_ok());

        result.map_err(|e| {
            debug!(service = name, degraded = degraded, error = %e, "Service call failed");
            ResilienceError::ServiceFailed {
                service: name.to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Force a service onto its fallback until [`restore_service`](Self::restore_service)
    pub fn degrade_service(&self, name: &str) -> ResilienceResult<()> {
        self.set_manual(name, true)
    }

    /// Clear a manual override; the policy for the current state still applies
    pub fn restore_service(&self, name: &str) -> ResilienceResult<()> {
        self.set_manual(name, false)
    }

    fn set_manual(&self, name: &str, manual: bool) -> ResilienceResult<()> {
        let flip = {
            let mut services = self.inner.services.write();
            let entry = services
                .get_mut(name)
                .ok_or_else(|| ResilienceError::ServiceNotFound(name.to_string()))?;
            let before = entry.degraded();
            entry.manual = manual;
            (entry.degraded() != before).then_some((entry.priority, entry.degraded()))
        };

        info!(service = name, manual_override = manual, "Manual degradation override changed");
        if let Some((priority, degraded)) = flip {
            self.inner.publish_flip(name, priority, degraded, true);
        }
        Ok(())
    }

    pub fn is_degraded(&self, name: &str) -> Option<bool> {
        self.inner.services.read().get(name).map(|e| e.degraded())
    }

    pub fn current_state(&self) -> SystemState {
        self.inner.machine.lock().state()
    }

    pub fn system_state(&self) -> SystemStateSnapshot {
        let machine = self.inner.machine.lock().clone();
        let services = self.inner.services.read();
        let mut degraded_services: Vec<String> = services
            .iter()
            .filter(|(_, e)| e.degraded())
            .map(|(name, _)| name.clone())
            .collect();
        degraded_services.sort();

        SystemStateSnapshot {
            state: machine.state(),
            last_transition_at: machine.last_transition_at(),
            consecutive_healthy_checks: machine.consecutive_healthy_checks(),
            degraded_services,
            total_services: services.len(),
        }
    }

    pub fn service_states(&self) -> Vec<ServiceState> {
        let services = self.inner.services.read();
        let mut states: Vec<ServiceState> = services
            .iter()
            .map(|(name, e)| ServiceState {
                name: name.clone(),
                priority: e.priority,
                degraded: e.degraded(),
                manual_override: e.manual,
                has_fallback: e.fallback.is_some(),
            })
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Recorder fed by `execute_service`; also usable for calls made elsewhere
    pub fn request_metrics(&self) -> Arc<RequestMetrics> {
        self.inner.requests.clone()
    }

    /// Classify a sample and apply any resulting transition
    pub fn observe(&self, sample: &LoadSample) -> SystemState {
        self.inner.observe(sample)
    }

    /// Take one sample and observe it; no-op while `degradation.enabled` is off
    pub async fn check(&self) -> SystemState {
        self.inner.check().await
    }

    /// Start the periodic sampling loop
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                let interval = inner.config.current().degradation.check_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {},
                    _ = inner.shutdown_notify.notified() => {
                        debug!("Degradation loop received shutdown notification");
                        break;
                    }
                }
                inner.check().await;
            }
            debug!("Degradation loop ended");
        });
        *self.inner.task.lock() = Some(handle);
        info!("Degradation controller started");
    }

    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown_notify.notify_waiters();
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("Degradation controller closed");
    }
}

impl ControllerInner {
    async fn check(&self) -> SystemState {
        if !self.config.current().degradation.enabled {
            return self.machine.lock().state();
        }
        let sample = self.sampler.sample().await;
        debug!(
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            latency_ms = sample.latency_ms,
            error_rate_percent = sample.error_rate_percent,
            "Load sampled"
        );
        self.observe(&sample)
    }

    fn observe(&self, sample: &LoadSample) -> SystemState {
        let config = self.config.current();
        let candidate = classify(sample, &config.degradation);
        let transition = {
            let mut machine = self.machine.lock();
            match machine.observe(candidate, config.degradation.recovery_threshold) {
                Some(transition) => transition,
                None => return machine.state(),
            }
        };

        self.events.publish(ResilienceEvent::StateTransition {
            from: transition.from,
            to: transition.to,
        });
        self.apply_policy(transition.to);

        let degraded = self.services.read().values().filter(|e| e.degraded()).count();
        log_state_transition(
            &transition.from.to_string(),
            &transition.to.to_string(),
            degraded,
        );
        transition.to
    }

    fn apply_policy(&self, state: SystemState) {
        let flips: Vec<(String, ServicePriority, bool)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, entry)| {
                    let before = entry.degraded();
                    entry.policy = degraded_by_policy(state, entry.priority);
                    let after = entry.degraded();
                    (after != before).then(|| (name.clone(), entry.priority, after))
                })
                .collect()
        };

        for (name, priority, degraded) in flips {
            self.publish_flip(&name, priority, degraded, false);
        }
    }

    fn publish_flip(&self, service: &str, priority: ServicePriority, degraded: bool, manual: bool) {
        if degraded {
            info!(service = service, priority = %priority, manual = manual, "Service degraded");
            self.events.publish(ResilienceEvent::ServiceDegraded {
                service: service.to_string(),
                priority,
                manual,
            });
        } else {
            info!(service = service, priority = %priority, manual = manual, "Service restored");
            self.events.publish(ResilienceEvent::ServiceRestored {
                service: service.to_string(),
                priority,
                manual,
            });
        }
    }
}
