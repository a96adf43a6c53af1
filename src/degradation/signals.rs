//! Load signals feeding the degradation state machine

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const MAX_OBSERVATIONS: usize = 10_000;

/// One reading of every load signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Mean request latency over the metrics window
    pub latency_ms: f64,
    pub error_rate_percent: f64,
}

/// Source of load samples
///
/// Implementations must not call into the services being evaluated.
#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> LoadSample;
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    at: Instant,
    latency: Duration,
    failed: bool,
}

/// Sliding window of request outcomes
#[derive(Debug)]
pub struct RequestMetrics {
    window: Duration,
    observations: Mutex<VecDeque<Observation>>,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RequestMetrics {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            observations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, latency: Duration, success: bool) {
        let now = Instant::now();
        let mut observations = self.observations.lock();
        Self::evict(&mut observations, now, self.window);
        if observations.len() >= MAX_OBSERVATIONS {
            observations.pop_front();
        }
        observations.push_back(Observation {
            at: now,
            latency,
            failed: !success,
        });
    }

    /// Mean latency in milliseconds and error rate in percent over the window
    pub fn snapshot(&self) -> (f64, f64) {
        let mut observations = self.observations.lock();
        Self::evict(&mut observations, Instant::now(), self.window);
        if observations.is_empty() {
            return (0.0, 0.0);
        }

        let count = observations.len() as f64;
        let total_ms: f64 = observations
            .iter()
            .map(|o| o.latency.as_secs_f64() * 1_000.0)
            .sum();
        let failures = observations.iter().filter(|o| o.failed).count() as f64;
        (total_ms / count, failures / count * 100.0)
    }

    pub fn len(&self) -> usize {
        self.observations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(observations: &mut VecDeque<Observation>, now: Instant, window: Duration) {
        while observations
            .front()
            .is_some_and(|o| now.saturating_duration_since(o.at) > window)
        {
            observations.pop_front();
        }
    }
}

/// Host CPU and memory from `sysinfo`, request signals from [`RequestMetrics`]
pub struct SystemLoadSampler {
    system: Mutex<System>,
    requests: Arc<RequestMetrics>,
}

impl std::fmt::Debug for SystemLoadSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemLoadSampler")
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl SystemLoadSampler {
    pub fn new(requests: Arc<RequestMetrics>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first reading
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            requests,
        }
    }
}

#[async_trait]
impl LoadSampler for SystemLoadSampler {
    async fn sample(&self) -> LoadSample {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            let total = system.total_memory();
            let memory = if total == 0 {
                0.0
            } else {
                system.used_memory() as f64 / total as f64 * 100.0
            };
            (f64::from(system.global_cpu_info().cpu_usage()), memory)
        };
        let (latency_ms, error_rate_percent) = self.requests.snapshot();
        LoadSample {
            cpu_percent,
            memory_percent,
            latency_ms,
            error_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metrics_mean_and_error_rate() {
        let metrics = RequestMetrics::new(Duration::from_secs(60));
        assert_eq!(metrics.snapshot(), (0.0, 0.0));

        metrics.record(Duration::from_millis(100), true);
        metrics.record(Duration::from_millis(300), false);
        let (latency, errors) = metrics.snapshot();
        assert!((latency - 200.0).abs() < 1e-6);
        assert!((errors - 50.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_observations_leave_the_window() {
        let metrics = RequestMetrics::new(Duration::from_secs(10));
        metrics.record(Duration::from_millis(900), false);
        tokio::time::advance(Duration::from_secs(11)).await;
        metrics.record(Duration::from_millis(100), true);
        assert_eq!(metrics.len(), 1);
        let (latency, errors) = metrics.snapshot();
        assert!((latency - 100.0).abs() < 1e-6);
        assert_eq!(errors, 0.0);
    }

    #[tokio::test]
    async fn test_system_sampler_reports_percentages() {
        let sampler = SystemLoadSampler::new(Arc::new(RequestMetrics::default()));
        let sample = sampler.sample().await;
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!(sample.cpu_percent >= 0.0);
    }
}
