use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::Catalog;
use crate::fetch::{CatalogSource, FetchLimits, RemoteCatalogFetcher};

pub const CACHE_NAMESPACE: &str = "anotherwikipages-list";
/// Lifetime of a non-empty catalog.
pub const SUCCESS_TTL_SECS: u64 = 86_400;
/// Lifetime of an empty catalog (failed or disabled fetch).
pub const FAILURE_TTL_SECS: u64 = 300;

const CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at_unix INTEGER NOT NULL
);
"#;

pub trait Clock {
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        unix_timestamp()
    }
}

/// Key/value blob store. TTLs are eviction hints; freshness is decided by
/// the record stored inside the blob.
pub trait CacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        (**self).set(key, value, ttl_secs)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub catalog: Catalog,
    pub fetched_at_unix: u64,
    pub expires_at_unix: u64,
}

impl CacheRecord {
    pub fn is_fresh(&self, now_unix: u64) -> bool {
        now_unix < self.expires_at_unix
    }

    pub fn is_negative(&self) -> bool {
        self.catalog.is_empty()
    }
}

/// Cache key for one remote source and limit combination.
pub fn cache_key(api_url: Option<&str>, limits: FetchLimits) -> String {
    let source = format!(
        "{}|{}|{}",
        api_url.unwrap_or_default(),
        limits.query_limit,
        limits.max_titles
    );
    let digest = format!("{:x}", Sha256::digest(source.as_bytes()));
    format!("{CACHE_NAMESPACE}:{}", &digest[..16])
}

/// Single-key catalog cache with negative caching.
///
/// No lock is held between a miss and the following store, so concurrent
/// misses may fetch twice; the last write wins.
pub struct CatalogCache<K, S, C = SystemClock> {
    store: K,
    fetcher: RemoteCatalogFetcher<S>,
    clock: C,
    key: String,
}

impl<K: CacheStore, S: CatalogSource> CatalogCache<K, S, SystemClock> {
    pub fn new(store: K, fetcher: RemoteCatalogFetcher<S>, key: impl Into<String>) -> Self {
        Self::with_clock(store, fetcher, key, SystemClock)
    }
}

impl<K: CacheStore, S: CatalogSource, C: Clock> CatalogCache<K, S, C> {
    pub fn with_clock(
        store: K,
        fetcher: RemoteCatalogFetcher<S>,
        key: impl Into<String>,
        clock: C,
    ) -> Self {
        Self {
            store,
            fetcher,
            clock,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn fetcher(&self) -> &RemoteCatalogFetcher<S> {
        &self.fetcher
    }

    /// Fresh cached catalog, or a newly fetched one stored for 24h (or 5 min if empty).
    pub fn get_catalog(&mut self) -> Catalog {
        let now = self.clock.now_unix();
        if let Some(record) = self.peek()
            && record.is_fresh(now)
        {
            tracing::debug!(key = %self.key, titles = record.catalog.len(), "Catalog cache hit");
            return record.catalog;
        }

        tracing::debug!(key = %self.key, "Catalog cache miss");
        let catalog = self.fetcher.fetch();
        let ttl_secs = if catalog.is_empty() {
            FAILURE_TTL_SECS
        } else {
            SUCCESS_TTL_SECS
        };
        let record = CacheRecord {
            catalog,
            fetched_at_unix: now,
            expires_at_unix: now.saturating_add(ttl_secs),
        };
        self.write(&record, ttl_secs);
        tracing::info!(titles = record.catalog.len(), ttl_secs, "Catalog refreshed");
        record.catalog
    }

    /// Stored record regardless of freshness; never fetches.
    pub fn peek(&self) -> Option<CacheRecord> {
        let bytes = match self.store.get(&self.key) {
            Ok(bytes) => bytes?,
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(key = %self.key, error = %message, "Catalog cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "Discarding undecodable catalog cache record");
                None
            }
        }
    }

    pub fn invalidate(&mut self) {
        if let Err(error) = self.store.delete(&self.key) {
            let message = format!("{error:#}");
            tracing::warn!(key = %self.key, error = %message, "Catalog cache delete failed");
        }
    }

    pub fn refresh(&mut self) -> Catalog {
        self.invalidate();
        self.get_catalog()
    }

    fn write(&self, record: &CacheRecord, ttl_secs: u64) {
        let result = serde_json::to_vec(record)
            .context("failed to encode catalog cache record")
            .and_then(|bytes| self.store.set(&self.key, &bytes, ttl_secs));
        if let Err(error) = result {
            let message = format!("{error:#}");
            tracing::warn!(key = %self.key, error = %message, "Catalog cache write failed");
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => {
                return Ok(Some(value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.lock()?
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// SQLite-backed store shared by every process pointed at the same database.
pub struct SqliteCacheStore {
    connection: Connection,
}

impl SqliteCacheStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let parent = db_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::from_connection(connection)
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(CACHE_SCHEMA_SQL)
            .context("failed to initialize cache schema")?;
        Ok(Self { connection })
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut statement = self
            .connection
            .prepare("SELECT value, expires_at_unix FROM cache_entries WHERE key = ?1 LIMIT 1")
            .context("failed to prepare cache lookup")?;
        let mut rows = statement
            .query([key])
            .with_context(|| format!("failed to read cache key {key}"))?;
        let row = match rows.next().context("failed to decode cache row")? {
            Some(row) => row,
            None => return Ok(None),
        };
        let value: Vec<u8> = row.get(0).context("failed to decode cache value")?;
        let expires_at_unix: i64 = row.get(1).context("failed to decode cache expiry")?;
        drop(rows);
        drop(statement);

        if u64::try_from(expires_at_unix).unwrap_or(0) <= unix_timestamp() {
            self.delete(key)?;
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let expires_at = unix_timestamp().saturating_add(ttl_secs);
        let expires_at = i64::try_from(expires_at).unwrap_or(i64::MAX);
        self.connection
            .execute(
                "INSERT INTO cache_entries (key, value, expires_at_unix) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_unix = excluded.expires_at_unix",
                params![key, value, expires_at],
            )
            .with_context(|| format!("failed to set cache key {key}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.connection
            .execute("DELETE FROM cache_entries WHERE key = ?1", [key])
            .with_context(|| format!("failed to delete cache key {key}"))?;
        Ok(())
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
