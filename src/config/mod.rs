//! # Configuration
//!
//! Typed configuration for every subsystem, loaded from TOML plus `RESILIENCE__*`
//! environment overrides and published to running components through a watch channel
//! so that updates apply without a restart.
//!
//! Durations are expressed in milliseconds (`*_ms`) or seconds (`*_secs`) so that the
//! TOML surface stays flat.

pub mod error;
pub mod manager;

pub use error::{ConfigResult, ConfigurationError};
pub use manager::{ConfigHandle, ConfigManager};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    pub kv: KvConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub degradation: DegradationConfig,
    pub events: EventsConfig,
}

impl ResilienceConfig {
    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.kv.validate()?;
        self.lock.validate(self.kv.instances.len())?;
        self.cache.validate()?;
        self.scheduler.validate()?;
        self.degradation.validate()?;
        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                "0",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Configuration suited to tests: in-memory instances, no disk tier, short timers
    pub fn for_testing() -> Self {
        Self {
            kv: KvConfig {
                instances: (1..=3)
                    .map(|i| KvInstanceConfig {
                        name: format!("kv-{i}"),
                        url: format!("memory://kv-{i}"),
                    })
                    .collect(),
                connect_timeout_ms: 200,
                command_timeout_ms: 200,
                health_check_interval_ms: 100,
            },
            lock: LockConfig {
                retry_delay_ms: 20,
                retry_jitter_ms: 10,
                ..LockConfig::default()
            },
            cache: CacheConfig {
                disk: DiskTierConfig {
                    enabled: false,
                    ..DiskTierConfig::default()
                },
                lock_retry_delay_ms: 20,
                lock_retry_count: 50,
                ..CacheConfig::default()
            },
            scheduler: SchedulerConfig {
                retry_base_delay_ms: 10,
                watchdog_interval_ms: 50,
                monitor_interval_ms: 100,
                ..SchedulerConfig::default()
            },
            degradation: DegradationConfig {
                check_interval_ms: 100,
                ..DegradationConfig::default()
            },
            events: EventsConfig::default(),
        }
    }
}

/// One key-value instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvInstanceConfig {
    pub name: String,
    /// `redis://...` for a Redis-compatible server, `memory://<name>` for an in-process store
    pub url: String,
}

/// Key-value instance set shared by the lock manager and the remote cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub instances: Vec<KvInstanceConfig>,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            instances: vec![KvInstanceConfig {
                name: "local".to_string(),
                url: "redis://127.0.0.1:6379".to_string(),
            }],
            connect_timeout_ms: 2_000,
            command_timeout_ms: 1_000,
            health_check_interval_ms: 5_000,
        }
    }
}

impl KvConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.name.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "name",
                    "kv.instances",
                ));
            }
            if !seen.insert(instance.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "kv.instances.name",
                    &instance.name,
                    "instance names must be unique",
                ));
            }
            if !(instance.url.starts_with("redis://")
                || instance.url.starts_with("rediss://")
                || instance.url.starts_with("memory://"))
            {
                return Err(ConfigurationError::invalid_value(
                    "kv.instances.url",
                    &instance.url,
                    "expected a redis:// or memory:// url",
                ));
            }
        }
        if self.connect_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(ConfigurationError::validation_error(
                "kv timeouts must be greater than 0",
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "kv.health_check_interval_ms",
                "0",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Quorum lock behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub key_prefix: String,
    pub default_lease_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub drift_factor: f64,
    /// Overrides `floor(N/2)+1`
    pub quorum: Option<usize>,
    pub fallback_to_memory: bool,
    /// Defaults to a third of the lease
    pub renewal_interval_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
            default_lease_ms: 10_000,
            retry_count: 3,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
            drift_factor: 0.01,
            quorum: None,
            fallback_to_memory: true,
            renewal_interval_ms: None,
        }
    }
}

impl LockConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    /// Majority of `instances` unless overridden
    pub fn quorum_for(&self, instances: usize) -> usize {
        self.quorum.unwrap_or(instances / 2 + 1)
    }

    /// Renewal cadence for a given lease
    pub fn renewal_interval(&self, lease: Duration) -> Duration {
        match self.renewal_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => lease / 3,
        }
    }

    fn validate(&self, instances: usize) -> ConfigResult<()> {
        if self.key_prefix.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "key_prefix",
                "lock",
            ));
        }
        if self.default_lease_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "lock.default_lease_ms",
                "0",
                "must be greater than 0",
            ));
        }
        if !(0.0..0.5).contains(&self.drift_factor) {
            return Err(ConfigurationError::invalid_value(
                "lock.drift_factor",
                self.drift_factor.to_string(),
                "must be within [0, 0.5)",
            ));
        }
        if let Some(quorum) = self.quorum {
            if quorum == 0 || (instances > 0 && quorum > instances) {
                return Err(ConfigurationError::invalid_value(
                    "lock.quorum",
                    quorum.to_string(),
                    format!("must be between 1 and the instance count ({instances})"),
                ));
            }
        }
        if let Some(interval) = self.renewal_interval_ms {
            if interval == 0 || interval >= self.default_lease_ms {
                return Err(ConfigurationError::invalid_value(
                    "lock.renewal_interval_ms",
                    interval.to_string(),
                    "must be greater than 0 and shorter than the default lease",
                ));
            }
        }
        Ok(())
    }
}

/// Process-memory cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    pub enabled: bool,
    pub max_entries: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

/// Remote key-value cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    pub enabled: bool,
    /// Name of the kv instance to use; the first instance when unset
    pub instance: Option<String>,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instance: None,
        }
    }
}

/// Local disk cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./cache"),
        }
    }
}

/// Tiered cache behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub key_prefix: String,
    pub default_ttl_secs: u64,
    pub null_ttl_secs: u64,
    pub ttl_jitter_factor: f64,
    pub memory: MemoryTierConfig,
    pub remote: RemoteTierConfig,
    pub disk: DiskTierConfig,
    pub lock_lease_ms: u64,
    pub lock_retry_count: u32,
    pub lock_retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "cache:".to_string(),
            default_ttl_secs: 3_600,
            null_ttl_secs: 60,
            ttl_jitter_factor: 0.2,
            memory: MemoryTierConfig::default(),
            remote: RemoteTierConfig::default(),
            disk: DiskTierConfig::default(),
            lock_lease_ms: 5_000,
            lock_retry_count: 10,
            lock_retry_delay_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn null_ttl(&self) -> Duration {
        Duration::from_secs(self.null_ttl_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if !(0.0..1.0).contains(&self.ttl_jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                "cache.ttl_jitter_factor",
                self.ttl_jitter_factor.to_string(),
                "must be within [0, 1)",
            ));
        }
        if self.null_ttl_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.null_ttl_secs",
                "0",
                "tombstones must expire",
            ));
        }
        if self.default_ttl_secs != 0 && self.null_ttl_secs > self.default_ttl_secs {
            return Err(ConfigurationError::validation_error(
                "cache.null_ttl_secs should not exceed cache.default_ttl_secs",
            ));
        }
        if self.memory.enabled && self.memory.max_entries == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.memory.max_entries",
                "0",
                "must be greater than 0",
            ));
        }
        if self.lock_lease_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.lock_lease_ms",
                "0",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Periodic snapshot of non-terminal tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./tasks.json"),
            interval_ms: 60_000,
        }
    }
}

/// Task scheduler behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_queue_length: usize,
    pub concurrency: usize,
    pub task_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backoff_factor: f64,
    pub watchdog_interval_ms: u64,
    pub monitor_interval_ms: u64,
    /// Queue fill ratio that triggers a high-water warning
    pub queue_warning_ratio: f64,
    pub persistence: PersistenceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 1_000,
            concurrency: 5,
            task_timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            backoff_factor: 2.0,
            watchdog_interval_ms: 1_000,
            monitor_interval_ms: 5_000,
            queue_warning_ratio: 0.8,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_queue_length == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_queue_length",
                "0",
                "must be greater than 0",
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.concurrency",
                "0",
                "must be greater than 0",
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.task_timeout_ms",
                "0",
                "must be greater than 0",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.backoff_factor",
                self.backoff_factor.to_string(),
                "must be at least 1.0",
            ));
        }
        if self.watchdog_interval_ms == 0 || self.monitor_interval_ms == 0 {
            return Err(ConfigurationError::validation_error(
                "scheduler sweep intervals must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.queue_warning_ratio) {
            return Err(ConfigurationError::invalid_value(
                "scheduler.queue_warning_ratio",
                self.queue_warning_ratio.to_string(),
                "must be within [0, 1]",
            ));
        }
        if self.persistence.enabled && self.persistence.interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.persistence.interval_ms",
                "0",
                "must be greater than 0 when persistence is enabled",
            ));
        }
        Ok(())
    }
}

/// Threshold triple for one load signal, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub under_load: f64,
    pub overloaded: f64,
    pub critical: f64,
}

impl SeverityThresholds {
    pub const fn new(under_load: f64, overloaded: f64, critical: f64) -> Self {
        Self {
            under_load,
            overloaded,
            critical,
        }
    }

    fn validate(&self, field: &str) -> ConfigResult<()> {
        if !(self.under_load < self.overloaded && self.overloaded < self.critical) {
            return Err(ConfigurationError::invalid_value(
                field,
                format!(
                    "{}/{}/{}",
                    self.under_load, self.overloaded, self.critical
                ),
                "thresholds must be strictly increasing",
            ));
        }
        if self.under_load < 0.0 {
            return Err(ConfigurationError::invalid_value(
                field,
                self.under_load.to_string(),
                "thresholds must not be negative",
            ));
        }
        Ok(())
    }
}

/// Degradation state machine behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub recovery_threshold: u32,
    pub cpu_percent: SeverityThresholds,
    pub memory_percent: SeverityThresholds,
    pub latency_ms: SeverityThresholds,
    pub error_rate_percent: SeverityThresholds,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 10_000,
            recovery_threshold: 3,
            cpu_percent: SeverityThresholds::new(70.0, 85.0, 95.0),
            memory_percent: SeverityThresholds::new(70.0, 85.0, 95.0),
            latency_ms: SeverityThresholds::new(500.0, 1_000.0, 2_000.0),
            error_rate_percent: SeverityThresholds::new(5.0, 10.0, 20.0),
        }
    }
}

impl DegradationConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.check_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "degradation.check_interval_ms",
                "0",
                "must be greater than 0",
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "degradation.recovery_threshold",
                "0",
                "must be greater than 0",
            ));
        }
        self.cpu_percent.validate("degradation.cpu_percent")?;
        self.memory_percent.validate("degradation.memory_percent")?;
        self.latency_ms.validate("degradation.latency_ms")?;
        self.error_rate_percent
            .validate("degradation.error_rate_percent")?;
        Ok(())
    }
}

/// Event fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ResilienceConfig::default().validate().is_ok());
        assert!(ResilienceConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_quorum_defaults_to_majority() {
        let lock = LockConfig::default();
        assert_eq!(lock.quorum_for(1), 1);
        assert_eq!(lock.quorum_for(3), 2);
        assert_eq!(lock.quorum_for(4), 3);
        assert_eq!(lock.quorum_for(5), 3);
    }

    #[test]
    fn test_renewal_interval_scales_with_lease() {
        let lock = LockConfig::default();
        assert_eq!(
            lock.renewal_interval(Duration::from_millis(9_000)),
            Duration::from_millis(3_000)
        );
        let fixed = LockConfig {
            renewal_interval_ms: Some(1_000),
            ..LockConfig::default()
        };
        assert_eq!(
            fixed.renewal_interval(Duration::from_millis(9_000)),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn test_quorum_larger_than_instances_is_rejected() {
        let mut config = ResilienceConfig::for_testing();
        config.lock.quorum = Some(4);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.quorum"));
    }

    #[test]
    fn test_non_monotonic_thresholds_are_rejected() {
        let mut config = ResilienceConfig::default();
        config.degradation.cpu_percent = SeverityThresholds::new(90.0, 85.0, 95.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_factor_bounds() {
        let mut config = ResilienceConfig::default();
        config.cache.ttl_jitter_factor = 1.0;
        assert!(config.validate().is_err());
        config.cache.ttl_jitter_factor = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_instance_names_are_rejected() {
        let mut config = ResilienceConfig::for_testing();
        config.kv.instances[1].name = "kv-1".to_string();
        assert!(config.validate().is_err());
    }
}
