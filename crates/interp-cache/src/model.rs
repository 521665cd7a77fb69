use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use stepwright_core_types::{Command, PageFingerprint};

use crate::key::{description_hash, CacheKey};

/// One memoized interpretation. Only `hit_count` and `last_hit_at` change
/// after the entry is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub description_hash: String,
    pub fingerprint: PageFingerprint,
    pub command: Command,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        description: &str,
        fingerprint: &PageFingerprint,
        command: Command,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: CacheKey::derive(description, fingerprint),
            description_hash: description_hash(description),
            fingerprint: fingerprint.clone(),
            command,
            hit_count: 0,
            last_hit_at: None,
            created_at: now,
            expires_at: now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn record_hit(&mut self, at: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_hit_at = Some(at);
    }
}

/// Aggregated hits for one key, flushed to the durable tier in batches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitRecord {
    pub key: CacheKey,
    pub count: u64,
    pub last_hit_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub l1_removed: usize,
    pub l2_removed: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.l1_removed + self.l2_removed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entries: u64,
    pub expired: u64,
    pub total_hits: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheStatus {
    pub enabled: bool,
    /// Durable tier unreachable; serving from memory only.
    pub degraded: bool,
    pub has_store: bool,
    pub l1_len: usize,
    pub l1_capacity: usize,
    pub pending_hits: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub resolver_calls: u64,
    pub resolver_errors: u64,
    pub store_errors: u64,
    pub evictions: u64,
}
