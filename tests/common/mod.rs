//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::config::{ConfigHandle, ResilienceConfig};
use resilience_core::degradation::{LoadSample, LoadSampler, RequestMetrics};
use resilience_core::events::EventPublisher;
use resilience_core::kv::{KvProvider, MemoryKvBackend};
use resilience_core::lock::LockManager;
use std::sync::Arc;

/// In-memory kv instances `kv-1..=kv-n`, returned both raw (for outage toggles) and wrapped
pub fn memory_backends(n: usize) -> (Vec<MemoryKvBackend>, Vec<Arc<KvProvider>>) {
    let memories: Vec<MemoryKvBackend> = (1..=n)
        .map(|i| MemoryKvBackend::new(format!("kv-{i}")))
        .collect();
    let providers = memories
        .iter()
        .cloned()
        .map(|m| Arc::new(KvProvider::from(m)))
        .collect();
    (memories, providers)
}

pub fn events() -> Arc<EventPublisher> {
    Arc::new(EventPublisher::new(1_024))
}

pub fn config_with<F>(edit: F) -> ConfigHandle
where
    F: FnOnce(&mut ResilienceConfig),
{
    let mut config = ResilienceConfig::for_testing();
    edit(&mut config);
    ConfigHandle::fixed(config)
}

pub fn lock_manager(providers: Vec<Arc<KvProvider>>) -> LockManager {
    LockManager::new(
        providers,
        ConfigHandle::fixed(ResilienceConfig::for_testing()),
        events(),
    )
}

/// Sampler returning whatever sample the test last scripted
#[derive(Debug, Default)]
pub struct ScriptedSampler {
    sample: Mutex<LoadSample>,
}

impl ScriptedSampler {
    pub fn set(&self, sample: LoadSample) {
        *self.sample.lock() = sample;
    }
}

#[async_trait]
impl LoadSampler for ScriptedSampler {
    async fn sample(&self) -> LoadSample {
        *self.sample.lock()
    }
}

pub fn request_metrics() -> Arc<RequestMetrics> {
    Arc::new(RequestMetrics::default())
}

pub fn normal() -> LoadSample {
    LoadSample {
        cpu_percent: 10.0,
        memory_percent: 20.0,
        latency_ms: 5.0,
        error_rate_percent: 0.0,
    }
}

pub fn with_cpu(cpu_percent: f64) -> LoadSample {
    LoadSample {
        cpu_percent,
        ..normal()
    }
}
