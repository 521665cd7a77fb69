use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::errors::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::model::{CacheEntry, HitRecord, StoreStats};
use crate::store::CacheStore;

/// Process-local store, used in tests and when no database is configured.
/// Can be switched offline to exercise outage handling.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    offline: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        self.ensure_online()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.ensure_online()?;
        let mut entries = self.entries.lock();
        let hits = entries
            .get(&entry.key)
            .map(|existing| (existing.hit_count, existing.last_hit_at));
        let mut stored = entry.clone();
        if let Some((hit_count, last_hit_at)) = hits {
            stored.hit_count = hit_count.max(entry.hit_count);
            stored.last_hit_at = last_hit_at.max(entry.last_hit_at);
        }
        entries.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn record_hits(&self, hits: &[HitRecord]) -> StoreResult<()> {
        self.ensure_online()?;
        let mut entries = self.entries.lock();
        for hit in hits {
            if let Some(entry) = entries.get_mut(&hit.key) {
                entry.hit_count += hit.count;
                entry.last_hit_at = entry.last_hit_at.max(Some(hit.last_hit_at));
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.ensure_online()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }

    async fn load_hot(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<CacheEntry>> {
        self.ensure_online()?;
        let mut live: Vec<CacheEntry> = self
            .entries
            .lock()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| b.last_hit_at.cmp(&a.last_hit_at))
        });
        live.truncate(limit);
        Ok(live)
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        self.ensure_online()?;
        let entries = self.entries.lock();
        Ok(StoreStats {
            entries: entries.len() as u64,
            expired: entries.values().filter(|e| e.is_expired(now)).count() as u64,
            total_hits: entries.values().map(|e| e.hit_count).sum(),
        })
    }
}
