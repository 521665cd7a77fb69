use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use stepwright_interp_cache::CacheStore;
use tokio::sync::OnceCell;

use crate::app::open_store;
use crate::cli::output::OutputFormat;
use crate::config::AppConfig;

pub struct CliContext {
    config: Arc<AppConfig>,
    config_path: PathBuf,
    output: OutputFormat,
    store: OnceCell<Arc<dyn CacheStore>>,
}

impl CliContext {
    pub fn new(config: AppConfig, config_path: PathBuf, output: OutputFormat) -> Self {
        Self {
            config: Arc::new(config),
            config_path,
            output,
            store: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        self.config.as_ref()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn output(&self) -> OutputFormat {
        self.output
    }

    /// The configured durable store, opened on first use.
    pub async fn store(&self) -> Result<Arc<dyn CacheStore>> {
        self.store
            .get_or_try_init(|| async {
                match open_store(&self.config.store)? {
                    Some(store) => Ok(store),
                    None => bail!("the durable cache store is disabled in this configuration"),
                }
            })
            .await
            .map(Arc::clone)
    }
}
