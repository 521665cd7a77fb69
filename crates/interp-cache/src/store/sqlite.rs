//! SQLite-backed durable tier.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use stepwright_core_types::PageFingerprint;
use tracing::{debug, info};

use crate::errors::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::model::{CacheEntry, HitRecord, StoreStats};
use crate::store::CacheStore;

const SELECT_COLUMNS: &str = "cache_key, source_description_hash, page_fingerprint, \
     resolved_command, hit_count, last_hit_at, created_at, expires_at";

#[derive(Clone)]
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Unavailable(format!("create {}: {err}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(target: "interp_cache", path = %path.display(), "opened cache store");
        Ok(store)
    }

    pub fn open_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS interpretation_cache (
                cache_key TEXT PRIMARY KEY,
                source_description_hash TEXT NOT NULL,
                page_fingerprint TEXT NOT NULL,
                resolved_command TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at INTEGER,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_interpretation_cache_expires
                ON interpretation_cache(expires_at);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("store task failed: {err}")))?
    }
}

struct RawRow {
    key: String,
    description_hash: String,
    fingerprint: String,
    command: String,
    hit_count: i64,
    last_hit_at: Option<i64>,
    created_at: i64,
    expires_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            description_hash: row.get(1)?,
            fingerprint: row.get(2)?,
            command: row.get(3)?,
            hit_count: row.get(4)?,
            last_hit_at: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> StoreResult<CacheEntry> {
        let ts = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
                key: self.key.clone(),
                reason: format!("timestamp {ms} out of range"),
            })
        };
        let created_at = ts(self.created_at)?;
        let expires_at = ts(self.expires_at)?;
        let last_hit_at = self.last_hit_at.map(ts).transpose()?;
        Ok(CacheEntry {
            command: serde_json::from_str(&self.command)?,
            key: CacheKey::from(self.key),
            description_hash: self.description_hash,
            fingerprint: PageFingerprint(self.fingerprint),
            hit_count: self.hit_count.max(0) as u64,
            last_hit_at,
            created_at,
            expires_at,
        })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM interpretation_cache WHERE cache_key = ?1");
            let raw = conn
                .query_row(&sql, params![key], RawRow::from_row)
                .optional()?;
            raw.map(RawRow::into_entry).transpose()
        })
        .await
    }

    async fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
        let command = serde_json::to_string(&entry.command)?;
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO interpretation_cache (
                    cache_key, source_description_hash, page_fingerprint, resolved_command,
                    hit_count, last_hit_at, created_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(cache_key) DO UPDATE SET
                    source_description_hash = excluded.source_description_hash,
                    page_fingerprint = excluded.page_fingerprint,
                    resolved_command = excluded.resolved_command,
                    hit_count = MAX(interpretation_cache.hit_count, excluded.hit_count),
                    expires_at = excluded.expires_at
                "#,
                params![
                    entry.key.as_str(),
                    entry.description_hash,
                    entry.fingerprint.as_str(),
                    command,
                    entry.hit_count as i64,
                    entry.last_hit_at.map(|t| t.timestamp_millis()),
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_hits(&self, hits: &[HitRecord]) -> StoreResult<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let hits = hits.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE interpretation_cache \
                     SET hit_count = hit_count + ?2, \
                         last_hit_at = MAX(COALESCE(last_hit_at, 0), ?3) \
                     WHERE cache_key = ?1",
                )?;
                for hit in &hits {
                    stmt.execute(params![
                        hit.key.as_str(),
                        hit.count as i64,
                        hit.last_hit_at.timestamp_millis()
                    ])?;
                }
            }
            tx.commit()?;
            debug!(target: "interp_cache", keys = hits.len(), "flushed hit counts");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM interpretation_cache WHERE cache_key = ?1",
                params![key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = now.timestamp_millis();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM interpretation_cache WHERE expires_at < ?1",
                params![now],
            )?)
        })
        .await
    }

    async fn load_hot(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<CacheEntry>> {
        let now = now.timestamp_millis();
        let limit = limit.min(i64::MAX as usize) as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM interpretation_cache \
                 WHERE expires_at >= ?1 \
                 ORDER BY hit_count DESC, last_hit_at DESC \
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![now, limit], RawRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawRow::into_entry).collect()
        })
        .await
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        let now = now.timestamp_millis();
        self.with_conn(move |conn| {
            let (entries, expired, total_hits): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN expires_at < ?1 THEN 1 ELSE 0 END), 0), \
                        COALESCE(SUM(hit_count), 0) \
                 FROM interpretation_cache",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(StoreStats {
                entries: entries.max(0) as u64,
                expired: expired.max(0) as u64,
                total_hits: total_hits.max(0) as u64,
            })
        })
        .await
    }
}
