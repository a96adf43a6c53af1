//! Configuration Manager
//!
//! Loads [`ResilienceConfig`] from a TOML file plus `RESILIENCE__SECTION__FIELD`
//! environment overrides and publishes snapshots on a watch channel. Components hold a
//! [`ConfigHandle`] and read the latest snapshot on every operation, so a successful
//! `update` or `reload` takes effect without restarting anything. Invalid updates are
//! rejected and the previous snapshot stays active.

use super::error::{ConfigResult, ConfigurationError};
use super::ResilienceConfig;
use crate::errors::{ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/resilience.toml";

/// Read-only view of the current configuration
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    receiver: watch::Receiver<Arc<ResilienceConfig>>,
}

impl ConfigHandle {
    /// A handle that never changes
    pub fn fixed(config: ResilienceConfig) -> Self {
        let (_sender, receiver) = watch::channel(Arc::new(config));
        Self { receiver }
    }

    /// Latest published snapshot
    pub fn current(&self) -> Arc<ResilienceConfig> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published snapshot; false once the manager is gone
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

/// Owner of the configuration and its hot-reload channel
#[derive(Debug)]
pub struct ConfigManager {
    environment: String,
    source_path: Option<PathBuf>,
    sender: watch::Sender<Arc<ResilienceConfig>>,
    file_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    /// Manager holding the default configuration
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(ResilienceConfig::default()));
        Self {
            environment: detect_environment(),
            source_path: None,
            sender,
            file_watcher: Mutex::new(None),
        }
    }

    /// Manager holding an already-built configuration
    pub fn from_config(config: ResilienceConfig) -> ConfigResult<Self> {
        config.validate()?;
        let (sender, _) = watch::channel(Arc::new(config));
        Ok(Self {
            environment: detect_environment(),
            source_path: None,
            sender,
            file_watcher: Mutex::new(None),
        })
    }

    /// Load from `RESILIENCE_CONFIG_PATH`, or `config/resilience.toml` when it exists
    pub fn load() -> ConfigResult<Arc<Self>> {
        let path = std::env::var("RESILIENCE_CONFIG_PATH")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });
        Ok(Arc::new(Self::load_from_path(path.as_deref())?))
    }

    /// Load from an explicit file (or environment only when `None`)
    pub fn load_from_path(path: Option<&Path>) -> ConfigResult<Self> {
        let config = read_sources(path)?;
        config.validate()?;

        let environment = detect_environment();
        info!(
            environment = %environment,
            path = ?path,
            kv_instances = config.kv.instances.len(),
            "Configuration loaded successfully"
        );

        let (sender, _) = watch::channel(Arc::new(config));
        Ok(Self {
            environment,
            source_path: path.map(Path::to_path_buf),
            sender,
            file_watcher: Mutex::new(None),
        })
    }

    /// Current snapshot
    pub fn config(&self) -> Arc<ResilienceConfig> {
        self.sender.borrow().clone()
    }

    /// Deployment environment name
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was loaded from, if any
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Handle for components that read configuration
    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            receiver: self.sender.subscribe(),
        }
    }

    /// Replace the configuration after validating it
    pub fn update(&self, config: ResilienceConfig) -> ResilienceResult<()> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected configuration update, keeping previous configuration");
            return Err(ResilienceError::ConfigInvalid(e.to_string()));
        }
        self.sender.send_replace(Arc::new(config));
        info!("Configuration updated");
        Ok(())
    }

    /// Apply an in-place edit to a copy of the current configuration
    pub fn modify<F>(&self, edit: F) -> ResilienceResult<()>
    where
        F: FnOnce(&mut ResilienceConfig),
    {
        let mut next = (*self.config()).clone();
        edit(&mut next);
        self.update(next)
    }

    /// Re-read the source file; returns whether the configuration changed
    pub fn reload(&self) -> ResilienceResult<bool> {
        let next = read_sources(self.source_path.as_deref())?;
        if *self.config() == next {
            debug!("Configuration reload found no changes");
            return Ok(false);
        }
        self.update(next)?;
        Ok(true)
    }

    /// Poll the source file's modification time and reload on change
    pub fn spawn_file_watcher(self: &Arc<Self>, interval: Duration) {
        let Some(path) = self.source_path.clone() else {
            debug!("No configuration file to watch");
            return;
        };

        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut last_modified = modified_at(&path);
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let modified = modified_at(&path);
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                match manager.reload() {
                    Ok(true) => info!(path = %path.display(), "Configuration file reloaded"),
                    Ok(false) => {}
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Configuration file reload failed, keeping previous configuration"
                    ),
                }
            }
        });

        if let Some(previous) = self.file_watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the file watcher if one is running
    pub fn stop_file_watcher(&self) {
        if let Some(handle) = self.file_watcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        self.stop_file_watcher();
    }
}

fn read_sources(path: Option<&Path>) -> ConfigResult<ResilienceConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigurationError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("RESILIENCE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let raw = builder.build()?;
    raw.try_deserialize::<ResilienceConfig>()
        .map_err(ConfigurationError::from)
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub(crate) fn detect_environment() -> String {
    std::env::var("RESILIENCE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("resilience.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_from_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            [scheduler]
            concurrency = 9

            [[kv.instances]]
            name = "a"
            url = "memory://a"
            "#,
        );

        let manager = ConfigManager::load_from_path(Some(path.as_path())).unwrap();
        let config = manager.config();
        assert_eq!(config.scheduler.concurrency, 9);
        assert_eq!(config.scheduler.max_queue_length, 1_000);
        assert_eq!(config.kv.instances.len(), 1);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = ConfigManager::load_from_path(Some(Path::new("/nonexistent/r.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_previous_config() {
        let manager = ConfigManager::from_config(ResilienceConfig::for_testing()).unwrap();
        let before = manager.config();

        let result = manager.modify(|c| c.scheduler.concurrency = 0);
        assert!(matches!(result, Err(ResilienceError::ConfigInvalid(_))));
        assert_eq!(*manager.config(), *before);
    }

    #[tokio::test]
    async fn test_handles_observe_updates() {
        let manager = ConfigManager::from_config(ResilienceConfig::for_testing()).unwrap();
        let mut handle = manager.handle();

        manager.modify(|c| c.scheduler.concurrency = 11).unwrap();
        assert!(handle.changed().await);
        assert_eq!(handle.current().scheduler.concurrency, 11);
    }

    #[test]
    fn test_reload_detects_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[scheduler]\nconcurrency = 2\n");
        let manager = ConfigManager::load_from_path(Some(path.as_path())).unwrap();
        assert!(!manager.reload().unwrap());

        write_config(&dir, "[scheduler]\nconcurrency = 4\n");
        assert!(manager.reload().unwrap());
        assert_eq!(manager.config().scheduler.concurrency, 4);

        write_config(&dir, "[scheduler]\nconcurrency = 0\n");
        assert!(manager.reload().is_err());
        assert_eq!(manager.config().scheduler.concurrency, 4);
    }

    #[test]
    fn test_fixed_handle_keeps_value() {
        let handle = ConfigHandle::fixed(ResilienceConfig::for_testing());
        assert_eq!(handle.current().kv.instances.len(), 3);
    }
}
