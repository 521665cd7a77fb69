//! Application configuration.
//!
//! Loaded from YAML, then patched from `STEPWRIGHT_*` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stepwright_interp_cache::CachePolicy;
use stepwright_scheduler::SchedulerConfig;

pub const ENV_GLOBAL_LIMIT: &str = "STEPWRIGHT_GLOBAL_LIMIT";
pub const ENV_TENANT_LIMIT: &str = "STEPWRIGHT_TENANT_LIMIT";
pub const ENV_CACHE_DB: &str = "STEPWRIGHT_CACHE_DB";
pub const ENV_LOG: &str = "STEPWRIGHT_LOG";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_run_log_capacity")]
    pub run_log_capacity: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            cache: CachePolicy::default(),
            store: StoreConfig::default(),
            run_log_capacity: default_run_log_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler or cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scheduler.global_limit > 0,
            "scheduler.global_limit must be at least 1"
        );
        anyhow::ensure!(
            self.scheduler.per_tenant_limit > 0,
            "scheduler.per_tenant_limit must be at least 1"
        );
        self.cache.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_GLOBAL_LIMIT) {
            self.scheduler.global_limit = parse_limit(ENV_GLOBAL_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TENANT_LIMIT) {
            self.scheduler.per_tenant_limit = parse_limit(ENV_TENANT_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CACHE_DB) {
            let raw = raw.trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("off") {
                self.store.enabled = false;
            } else {
                self.store.enabled = true;
                self.store.path = Some(PathBuf::from(raw));
            }
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log_level = level;
        }
        Ok(())
    }
}

fn parse_limit(key: &str, raw: &str) -> Result<usize> {
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got {raw:?}"))?;
    anyhow::ensure!(value > 0, "{key} must be at least 1");
    Ok(value)
}

fn default_run_log_capacity() -> usize {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Durable interpretation cache location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_enabled")]
    pub enabled: bool,
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_store_enabled(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.path.clone().or_else(|| {
            dirs::data_dir().map(|mut dir| {
                dir.push("stepwright");
                dir.push("interp-cache.db");
                dir
            })
        })
    }
}

fn default_store_enabled() -> bool {
    true
}
