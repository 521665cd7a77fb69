pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreResult;
use crate::key::CacheKey;
use crate::model::{CacheEntry, HitRecord, StoreStats};

/// Durable tier. Shared across processes; `put` is an idempotent upsert and
/// the last writer wins since content for a key is deterministic.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>>;
    async fn put(&self, entry: &CacheEntry) -> StoreResult<()>;
    /// Add batched hit counts; unknown keys are ignored.
    async fn record_hits(&self, hits: &[HitRecord]) -> StoreResult<()>;
    async fn delete(&self, key: &CacheKey) -> StoreResult<bool>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
    /// Non-expired entries, most hit first.
    async fn load_hot(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<CacheEntry>>;
    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<StoreStats>;
}

#[async_trait]
impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    async fn get(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        (**self).get(key).await
    }

    async fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
        (**self).put(entry).await
    }

    async fn record_hits(&self, hits: &[HitRecord]) -> StoreResult<()> {
        (**self).record_hits(hits).await
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        (**self).delete(key).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        (**self).delete_expired(now).await
    }

    async fn load_hot(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<CacheEntry>> {
        (**self).load_hot(now, limit).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        (**self).stats(now).await
    }
}
