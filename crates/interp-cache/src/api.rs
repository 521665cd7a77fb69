use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use stepwright_core_types::{Command, PageState};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{CacheError, StoreError};
use crate::flight::Flight;
use crate::key::CacheKey;
use crate::metrics::CacheMetrics;
use crate::model::{CacheEntry, CacheStatus, HitRecord, StoreStats, SweepStats};
use crate::policy::CachePolicy;
use crate::resolver::AiResolver;
use crate::store::CacheStore;

pub struct InterpretationCacheBuilder {
    policy: CachePolicy,
    resolver: Arc<dyn AiResolver>,
    store: Option<Arc<dyn CacheStore>>,
    background: bool,
}

impl InterpretationCacheBuilder {
    pub fn new(policy: CachePolicy, resolver: Arc<dyn AiResolver>) -> Self {
        Self {
            policy,
            resolver,
            store: None,
            background: true,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip the sweeper and hit flusher; callers drive `sweep_expired` and
    /// `flush_hits` themselves.
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    pub async fn build(self) -> Arc<InterpretationCache> {
        let cache = Arc::new(InterpretationCache::new(self.policy, self.resolver, self.store));
        if cache.policy.enabled && cache.policy.warm_on_boot {
            let loaded = cache.warm_from_store().await;
            if loaded > 0 {
                info!(target: "interp_cache", loaded, "warmed memory tier from store");
            }
        }
        if self.background {
            cache.start_background_tasks();
        }
        cache
    }
}

/// Memo of (step description, page fingerprint) to command.
///
/// L1 is a bounded LRU in process memory; L2 is the optional durable
/// store and the source of truth across restarts. Durable-tier failures
/// are logged and the cache keeps serving from memory.
pub struct InterpretationCache {
    policy: CachePolicy,
    resolver: Arc<dyn AiResolver>,
    store: Option<Arc<dyn CacheStore>>,
    l1: Mutex<LruCache<CacheKey, CacheEntry>>,
    flight: Flight,
    pending_hits: Mutex<HashMap<CacheKey, HitRecord>>,
    metrics: CacheMetrics,
    degraded: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl InterpretationCache {
    pub fn new(
        policy: CachePolicy,
        resolver: Arc<dyn AiResolver>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(policy.l1_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            policy,
            resolver,
            store,
            l1: Mutex::new(LruCache::new(capacity)),
            flight: Flight::default(),
            pending_hits: Mutex::new(HashMap::new()),
            metrics: CacheMetrics::default(),
            degraded: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub async fn resolve(&self, description: &str, page: &PageState) -> Result<Command, CacheError> {
        if !self.policy.enabled {
            return self.call_resolver(description, page).await;
        }
        let key = CacheKey::derive(description, &page.fingerprint);
        if let Some(command) = self.lookup_l1(&key, Utc::now()) {
            return Ok(command);
        }

        let _flight = self.flight.acquire(&key).await;
        // A concurrent miss may have filled L1 while we waited.
        if let Some(command) = self.lookup_l1(&key, Utc::now()) {
            return Ok(command);
        }
        if let Some(command) = self.lookup_l2(&key, Utc::now()).await {
            return Ok(command);
        }

        self.metrics.record_miss();
        let command = self.call_resolver(description, page).await?;
        let entry = CacheEntry::new(
            description,
            &page.fingerprint,
            command.clone(),
            Utc::now(),
            self.policy.ttl(),
        );
        debug!(target: "interp_cache", key = %entry.key, command = %command, "cached new interpretation");
        self.insert_l1(entry.clone());
        if let Some(store) = &self.store {
            let outcome = store.put(&entry).await;
            self.observe_store("put", outcome);
        }
        Ok(command)
    }

    async fn call_resolver(&self, description: &str, page: &PageState) -> Result<Command, CacheError> {
        self.metrics.record_resolver_call();
        self.resolver.resolve(description, page).await.map_err(|err| {
            self.metrics.record_resolver_error();
            warn!(target: "interp_cache", step = description, error = %err, "resolver failed");
            CacheError::Resolution(err)
        })
    }

    fn lookup_l1(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Command> {
        let mut l1 = self.l1.lock();
        let entry = l1.get_mut(key)?;
        if entry.is_expired(now) {
            l1.pop(key);
            return None;
        }
        entry.record_hit(now);
        let command = entry.command.clone();
        drop(l1);
        self.metrics.record_l1_hit();
        self.queue_hit(key, now);
        Some(command)
    }

    async fn lookup_l2(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Command> {
        let store = self.store.as_ref()?;
        let outcome = store.get(key).await;
        let mut entry = self.observe_store("get", outcome).flatten()?;
        if entry.is_expired(now) {
            return None;
        }
        entry.record_hit(now);
        let command = entry.command.clone();
        self.insert_l1(entry);
        self.metrics.record_l2_hit();
        self.queue_hit(key, now);
        Some(command)
    }

    fn insert_l1(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        if let Some((evicted, _)) = self.l1.lock().push(key.clone(), entry) {
            if evicted != key {
                self.metrics.record_eviction();
            }
        }
    }

    fn queue_hit(&self, key: &CacheKey, at: DateTime<Utc>) {
        if self.store.is_none() {
            return;
        }
        let mut pending = self.pending_hits.lock();
        let record = pending.entry(key.clone()).or_insert_with(|| HitRecord {
            key: key.clone(),
            count: 0,
            last_hit_at: at,
        });
        record.count += 1;
        record.last_hit_at = record.last_hit_at.max(at);
    }

    /// Write buffered hit counts to the durable tier. Records are dropped if
    /// the write fails; counts are advisory.
    pub async fn flush_hits(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let batch: Vec<HitRecord> = self.pending_hits.lock().drain().map(|(_, v)| v).collect();
        if batch.is_empty() {
            return 0;
        }
        let outcome = store.record_hits(&batch).await;
        match self.observe_store("record_hits", outcome) {
            Some(()) => batch.len(),
            None => 0,
        }
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let in_l1 = self.l1.lock().pop(key).is_some();
        self.pending_hits.lock().remove(key);
        let in_l2 = match &self.store {
            Some(store) => {
                let outcome = store.delete(key).await;
                self.observe_store("delete", outcome).unwrap_or(false)
            }
            None => false,
        };
        in_l1 || in_l2
    }

    pub async fn sweep_expired(&self) -> SweepStats {
        let now = Utc::now();
        let l1_removed = {
            let mut l1 = self.l1.lock();
            let expired: Vec<CacheKey> = l1
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                l1.pop(key);
            }
            expired.len()
        };
        let l2_removed = match &self.store {
            Some(store) => {
                let outcome = store.delete_expired(now).await;
                self.observe_store("delete_expired", outcome).unwrap_or(0)
            }
            None => 0,
        };
        let stats = SweepStats {
            l1_removed,
            l2_removed,
        };
        if stats.total() > 0 {
            debug!(target: "interp_cache", l1_removed, l2_removed, "swept expired entries");
        }
        stats
    }

    /// Bulk-load the most hit, non-expired entries into L1. The hottest
    /// entry ends up most recently used.
    pub async fn warm_from_store(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let outcome = store.load_hot(Utc::now(), self.policy.l1_capacity).await;
        let Some(entries) = self.observe_store("load_hot", outcome) else {
            return 0;
        };
        let loaded = entries.len();
        let mut l1 = self.l1.lock();
        for entry in entries.into_iter().rev() {
            l1.put(entry.key.clone(), entry);
        }
        loaded
    }

    pub async fn store_stats(&self) -> Result<Option<StoreStats>, CacheError> {
        match &self.store {
            Some(store) => Ok(Some(store.stats(Utc::now()).await?)),
            None => Ok(None),
        }
    }

    /// Flush pending hits and stop background tasks.
    pub async fn drain(&self) {
        let flushed = self.flush_hits().await;
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        debug!(target: "interp_cache", flushed, "cache drained");
    }

    pub fn status(&self) -> CacheStatus {
        let metrics = self.metrics.snapshot();
        CacheStatus {
            enabled: self.policy.enabled,
            degraded: self.degraded.load(Ordering::Relaxed),
            has_store: self.store.is_some(),
            l1_len: self.l1.lock().len(),
            l1_capacity: self.policy.l1_capacity,
            pending_hits: self.pending_hits.lock().len(),
            l1_hits: metrics.l1_hits,
            l2_hits: metrics.l2_hits,
            misses: metrics.misses,
            resolver_calls: metrics.resolver_calls,
            resolver_errors: metrics.resolver_errors,
            store_errors: metrics.store_errors,
            evictions: metrics.evictions,
        }
    }

    /// Track durable-tier health. Errors flip the cache into degraded mode
    /// with a single warning; the next success clears it.
    fn observe_store<T>(&self, op: &'static str, outcome: Result<T, StoreError>) -> Option<T> {
        match outcome {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(target: "interp_cache", op, "cache store recovered");
                }
                Some(value)
            }
            Err(err) => {
                self.metrics.record_store_error();
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        target: "interp_cache",
                        op,
                        error = %err,
                        "cache store unavailable; continuing memory-only"
                    );
                } else {
                    debug!(target: "interp_cache", op, error = %err, "cache store still unavailable");
                }
                None
            }
        }
    }

    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut handles = self.background.lock();
        if !handles.is_empty() || !self.policy.enabled {
            return;
        }
        if self.policy.sweep_interval_sec > 0 {
            let weak = Arc::downgrade(self);
            let period = Duration::from_secs(self.policy.sweep_interval_sec);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(cache) = weak.upgrade() else {
                        break;
                    };
                    cache.sweep_expired().await;
                }
            }));
        }
        if self.policy.hit_flush_interval_ms > 0 && self.store.is_some() {
            let weak = Arc::downgrade(self);
            let period = Duration::from_millis(self.policy.hit_flush_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(cache) = weak.upgrade() else {
                        break;
                    };
                    cache.flush_hits().await;
                }
            }));
        }
    }
}

impl Drop for InterpretationCache {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}
