use std::sync::Arc;

use anyhow::{Context, Result};
use stepwright_run_executor::{DriverFactory, RunExecutor, RunRegistry, TestRunService};
use stepwright_event_bus::Subscription;
use stepwright_interp_cache::{
    AiResolver, CacheStore, InterpretationCache, InterpretationCacheBuilder, SqliteCacheStore,
};
use stepwright_scheduler::SchedulerService;
use tracing::{debug, info};

use crate::config::{AppConfig, StoreConfig};

/// Open the durable tier described by `config`, if any.
pub fn open_store(config: &StoreConfig) -> Result<Option<Arc<dyn CacheStore>>> {
    let Some(path) = config.resolved_path() else {
        return Ok(None);
    };
    let store = SqliteCacheStore::open(&path)
        .with_context(|| format!("opening cache store at {}", path.display()))?;
    info!(path = %path.display(), "opened interpretation cache store");
    Ok(Some(Arc::new(store)))
}

/// Everything a process needs to accept and execute test runs.
pub struct AppContext {
    config: AppConfig,
    scheduler: Arc<SchedulerService>,
    cache: Arc<InterpretationCache>,
    runs: TestRunService<SchedulerService>,
    _events: Subscription,
}

impl AppContext {
    pub async fn build(
        config: AppConfig,
        resolver: Arc<dyn AiResolver>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Result<Self> {
        let store = open_store(&config.store)?;
        Self::build_with_store(config, resolver, drivers, store).await
    }

    pub async fn build_with_store(
        config: AppConfig,
        resolver: Arc<dyn AiResolver>,
        drivers: Arc<dyn DriverFactory>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        let mut builder = InterpretationCacheBuilder::new(config.cache.clone(), resolver);
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        let cache = builder.build().await;

        let scheduler = Arc::new(SchedulerService::new(config.scheduler.clone()));
        let events = scheduler.on_task_event(|event| {
            debug!(
                target: "scheduler",
                event = event.name(),
                task = %event.task().id,
                tenant = %event.task().tenant_id,
                "task event"
            );
        });
        scheduler.start().await;

        let registry = Arc::new(RunRegistry::with_log_capacity(config.run_log_capacity));
        let executor = Arc::new(RunExecutor::new(Arc::clone(&cache), drivers, registry));
        let runs = TestRunService::new(Arc::clone(&scheduler), executor);

        info!(
            global_limit = config.scheduler.global_limit,
            per_tenant_limit = config.scheduler.per_tenant_limit,
            cache_enabled = config.cache.enabled,
            "stepwright ready"
        );
        Ok(Self {
            config,
            scheduler,
            cache,
            runs,
            _events: events,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<InterpretationCache> {
        &self.cache
    }

    pub fn runs(&self) -> &TestRunService<SchedulerService> {
        &self.runs
    }

    /// Stop accepting work, settle queued runs and flush pending cache hits.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.cache.drain().await;
        info!("stepwright stopped");
    }
}
