use anyhow::Result;

use super::cache::cmd_cache;
use super::commands::Commands;
use super::config::cmd_config;
use super::context::CliContext;
use super::env::CliArgs;

pub async fn dispatch(cli: &CliArgs, ctx: &CliContext) -> Result<()> {
    match &cli.command {
        Commands::Config(args) => cmd_config(args.clone(), ctx).await,
        Commands::Cache(args) => cmd_cache(args.clone(), ctx).await,
    }
}
