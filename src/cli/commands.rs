use clap::Subcommand;

use super::cache::CacheArgs;
use super::config::ConfigArgs;

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect the effective configuration
    Config(ConfigArgs),

    /// Operate the durable interpretation cache
    Cache(CacheArgs),
}
