use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    resolver_calls: AtomicU64,
    resolver_errors: AtomicU64,
    store_errors: AtomicU64,
    evictions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheMetrics {
    pub fn record_l1_hit(&self) {
        bump(&self.l1_hits);
    }

    pub fn record_l2_hit(&self) {
        bump(&self.l2_hits);
    }

    pub fn record_miss(&self) {
        bump(&self.misses);
    }

    pub fn record_resolver_call(&self) {
        bump(&self.resolver_calls);
    }

    pub fn record_resolver_error(&self) {
        bump(&self.resolver_errors);
    }

    pub fn record_store_error(&self) {
        bump(&self.store_errors);
    }

    pub fn record_eviction(&self) {
        bump(&self.evictions);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resolver_calls: self.resolver_calls.load(Ordering::Relaxed),
            resolver_errors: self.resolver_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub resolver_calls: u64,
    pub resolver_errors: u64,
    pub store_errors: u64,
    pub evictions: u64,
}
