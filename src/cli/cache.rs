use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use stepwright_core_types::PageFingerprint;
use stepwright_interp_cache::CacheKey;
use tracing::info;

use crate::cli::context::CliContext;
use crate::cli::output::emit;

#[derive(Args, Clone, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum CacheAction {
    /// Entry counts and accumulated hits in the durable store
    Stats,

    /// Delete expired entries from the durable store
    Sweep,

    /// Print the cache key for a step description on a page
    Key {
        /// Natural-language step description
        description: String,

        /// Page fingerprint
        fingerprint: String,
    },

    /// Remove one entry by key
    Invalidate {
        /// Cache key as printed by `cache key`
        key: String,
    },
}

#[derive(Serialize)]
struct SweepReport {
    removed: usize,
}

#[derive(Serialize)]
struct InvalidateReport {
    key: String,
    removed: bool,
}

pub async fn cmd_cache(args: CacheArgs, ctx: &CliContext) -> Result<()> {
    match args.action {
        CacheAction::Stats => {
            let store = ctx.store().await?;
            let stats = store
                .stats(Utc::now())
                .await
                .context("reading cache statistics")?;
            emit(ctx.output(), &stats, |s| {
                format!(
                    "entries: {}\nexpired: {}\ntotal hits: {}",
                    s.entries, s.expired, s.total_hits
                )
            })?;
        }
        CacheAction::Sweep => {
            let store = ctx.store().await?;
            let removed = store
                .delete_expired(Utc::now())
                .await
                .context("sweeping expired entries")?;
            info!(target: "interp_cache", removed, "swept durable store");
            emit(ctx.output(), &SweepReport { removed }, |r| {
                format!("removed {} expired entries", r.removed)
            })?;
        }
        CacheAction::Key {
            description,
            fingerprint,
        } => {
            let key = CacheKey::derive(&description, &PageFingerprint::from(fingerprint.as_str()));
            println!("{key}");
        }
        CacheAction::Invalidate { key } => {
            let store = ctx.store().await?;
            let removed = store
                .delete(&CacheKey::from(key.as_str()))
                .await
                .context("deleting cache entry")?;
            emit(ctx.output(), &InvalidateReport { key, removed }, |r| {
                if r.removed {
                    format!("removed {}", r.key)
                } else {
                    format!("{} not found", r.key)
                }
            })?;
        }
    }
    Ok(())
}
