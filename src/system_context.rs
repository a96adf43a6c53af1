use crate::cache::CacheLayer;
use crate::config::{ConfigManager, KvInstanceConfig, ResilienceConfig};
use crate::degradation::DegradationController;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::EventPublisher;
use crate::kv::{BackendHealthSupervisor, KvProvider};
use crate::lock::LockManager;
use crate::scheduler::TaskScheduler;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Shared resilience components and configuration
///
/// Dependency container owning:
/// - Configuration manager and its hot-reload channel
/// - Key-value instance set and health supervisor
/// - Quorum lock manager
/// - Tiered cache layer
/// - Task scheduler
/// - Degradation controller
/// - Event publisher shared by all of the above
pub struct ResilienceContext {
    /// Instance ID for log correlation
    pub system_id: Uuid,

    /// Configuration manager with environment-aware loading
    pub config_manager: Arc<ConfigManager>,

    /// Event publisher
    pub event_publisher: Arc<EventPublisher>,

    pub health_supervisor: Arc<BackendHealthSupervisor>,

    pub lock_manager: LockManager,

    pub cache: Arc<CacheLayer>,

    pub scheduler: TaskScheduler,

    pub degradation: DegradationController,

    backends: Arc<Mutex<Vec<(KvInstanceConfig, Arc<KvProvider>)>>>,
    reload_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("system_id", &self.system_id)
            .field("environment", &self.config_manager.environment())
            .field("kv_instances", &self.lock_manager.backend_names())
            .field("cache_tiers", &self.cache.tier_kinds())
            .finish()
    }
}

impl ResilienceContext {
    /// Create a context from auto-detected configuration
    pub async fn new() -> ResilienceResult<Self> {
        info!("Initializing ResilienceContext with auto-detected configuration");
        let config_manager = ConfigManager::load().map_err(|e| {
            error!(error = %e, "Failed to load configuration");
            ResilienceError::from(e)
        })?;
        Self::from_config(config_manager).await
    }

    /// Create a context from an existing configuration manager
    pub async fn from_config(config_manager: Arc<ConfigManager>) -> ResilienceResult<Self> {
        let system_id = Uuid::new_v4();
        let config = config_manager.config();
        info!(
            system_id = %system_id,
            environment = %config_manager.environment(),
            "Bootstrapping resilience components"
        );

        let event_publisher = Arc::new(EventPublisher::new(config.events.channel_capacity));
        let backends = build_backends(&config, &[])?;
        let providers: Vec<Arc<KvProvider>> = backends.iter().map(|(_, p)| p.clone()).collect();

        let health_supervisor = Arc::new(BackendHealthSupervisor::new(
            providers.clone(),
            config_manager.handle(),
            event_publisher.clone(),
        ));
        let lock_manager = LockManager::new(
            providers.clone(),
            config_manager.handle(),
            event_publisher.clone(),
        );
        let cache = Arc::new(CacheLayer::from_config(
            config_manager.handle(),
            &providers,
            Some(lock_manager.clone()),
            event_publisher.clone(),
        )?);
        let scheduler = TaskScheduler::new(config_manager.handle(), event_publisher.clone());
        let degradation = DegradationController::with_system_sampler(
            config_manager.handle(),
            event_publisher.clone(),
        );

        info!(system_id = %system_id, kv_instances = providers.len(), "ResilienceContext ready");
        Ok(Self {
            system_id,
            config_manager,
            event_publisher,
            health_supervisor,
            lock_manager,
            cache,
            scheduler,
            degradation,
            backends: Arc::new(Mutex::new(backends)),
            reload_task: Mutex::new(None),
        })
    }

    /// Context over in-memory instances with short timers
    pub async fn for_testing() -> ResilienceResult<Self> {
        let manager = ConfigManager::from_config(ResilienceConfig::for_testing())?;
        Self::from_config(Arc::new(manager)).await
    }

    /// Current key-value providers in configuration order
    pub fn kv_backends(&self) -> Vec<Arc<KvProvider>> {
        self.backends.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Start every background loop and follow configuration changes
    pub async fn start(&self) -> ResilienceResult<()> {
        self.health_supervisor.start();
        self.scheduler.start().await?;
        self.degradation.start();

        let mut handle = self.config_manager.handle();
        let backends = self.backends.clone();
        let lock_manager = self.lock_manager.clone();
        let health = self.health_supervisor.clone();
        let task = tokio::spawn(async move {
            while handle.changed().await {
                let config = handle.current();
                let current: Vec<KvInstanceConfig> =
                    backends.lock().iter().map(|(c, _)| c.clone()).collect();
                if current == config.kv.instances {
                    continue;
                }

                let existing = backends.lock().clone();
                match build_backends(&config, &existing) {
                    Ok(rebuilt) => {
                        let providers: Vec<Arc<KvProvider>> =
                            rebuilt.iter().map(|(_, p)| p.clone()).collect();
                        lock_manager.set_backends(providers.clone());
                        health.set_backends(providers);
                        *backends.lock() = rebuilt;
                    }
                    Err(e) => error!(error = %e, "Failed to apply kv instance change"),
                }
            }
        });
        *self.reload_task.lock() = Some(task);

        info!(system_id = %self.system_id, "Resilience background services started");
        Ok(())
    }

    /// Stop background loops in reverse dependency order
    pub async fn close(&self) -> ResilienceResult<()> {
        let reload = self.reload_task.lock().take();
        if let Some(task) = reload {
            task.abort();
            let _ = task.await;
        }
        self.config_manager.stop_file_watcher();

        let scheduler_result = self.scheduler.close().await;
        self.degradation.close().await;
        self.health_supervisor.close().await;
        self.lock_manager.close().await;
        info!(system_id = %self.system_id, "ResilienceContext closed");
        scheduler_result
    }
}

/// Providers for `config.kv.instances`, reusing entries whose name and URL are unchanged
fn build_backends(
    config: &ResilienceConfig,
    existing: &[(KvInstanceConfig, Arc<KvProvider>)],
) -> ResilienceResult<Vec<(KvInstanceConfig, Arc<KvProvider>)>> {
    config
        .kv
        .instances
        .iter()
        .map(|instance| -> ResilienceResult<(KvInstanceConfig, Arc<KvProvider>)> {
            let reused = existing
                .iter()
                .find(|(c, _)| c == instance)
                .map(|(_, p)| p.clone());
            let provider = match reused {
                Some(provider) => provider,
                None => Arc::new(KvProvider::from_config(instance, &config.kv)?),
            };
            Ok((instance.clone(), provider))
        })
        .collect()
}
