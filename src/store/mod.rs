//! Best-effort key/value cache with expiry, plus an append-only analytics log.
//!
//! Two engines sit behind [`CacheBackend`]:
//!
//! - [`PostgresBackend`] — pooled, used when `DATABASE_URL` is reachable at startup
//! - [`SqliteBackend`] — local file, always opened as the fallback
//!
//! The engine choice is made once, in [`Store::open`]. After that, an
//! operation only moves to the next backend when the current one cannot hand
//! out a connection at all ([`StoreError::Unavailable`]); a failed query is
//! final for that call.
//!
//! Nothing here reports failure to the caller. A broken store reads as an
//! empty cache and drops writes, and the error goes to the log.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::StorageConfig;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Upper bound for a TTL (about 100 years), keeps expiry arithmetic in range.
const MAX_TTL_MINUTES: i64 = 100 * 365 * 24 * 60;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No connection could be obtained from the engine.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The engine answered but the statement failed.
    #[error("storage query failed: {0}")]
    Query(String),
}

/// One cached value. Reads at or after `expires_at` see nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Builds an entry expiring `ttl_minutes` after `now`.
    /// Negative TTLs are treated as zero (already expired).
    pub fn new(key: &str, value: &str, ttl_minutes: i64, now: DateTime<Utc>) -> Self {
        let ttl = TimeDelta::minutes(ttl_minutes.clamp(0, MAX_TTL_MINUTES));
        Self {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: now + ttl,
        }
    }

    #[cfg(test)]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A row in the analytics table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub user_id: String,
    pub action: String,
    pub details: String,
}

/// A storage engine. Implementations report every failure; the [`Store`]
/// decides what to do with it.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Engine name shown in status output (e.g. `"sqlite"`).
    fn name(&self) -> &str;

    /// Returns the value for `key` if it exists and expires after `now`.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError>;

    /// Inserts or replaces the entry for `entry.key`.
    async fn set(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Appends one analytics row.
    async fn log(&self, event: &AnalyticsEvent) -> Result<(), StoreError>;

    /// Deletes entries that expired at or before `now`. Returns the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Derives an opaque cache key for free-form query text:
/// `{namespace}_{sha256(query)}`.
pub fn cache_key(namespace: &str, query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    format!("{namespace}_{}", hex::encode(digest))
}

/// The cache facade handed to callers.
pub struct Store {
    /// In preference order; later entries are only tried when earlier
    /// ones are unavailable.
    backends: Vec<Box<dyn CacheBackend>>,
}

impl Store {
    /// Opens the local file and, if configured and reachable, the relational
    /// pool in front of it. Never fails: with no usable engine at all the
    /// store behaves as a permanently empty cache.
    pub async fn open(config: &StorageConfig) -> Self {
        let mut backends: Vec<Box<dyn CacheBackend>> = Vec::new();

        if let Some(url) = config.database_url() {
            match PostgresBackend::connect(url).await {
                Ok(pg) => {
                    info!("PostgreSQL pool initialized");
                    backends.push(Box::new(pg));
                }
                Err(e) => warn!("PostgreSQL not available, using local file only: {e}"),
            }
        }

        match SqliteBackend::open(&config.sqlite_path) {
            Ok(sqlite) => {
                info!("SQLite database initialized at {}", config.sqlite_path.display());
                backends.push(Box::new(sqlite));
            }
            Err(e) => error!("SQLite initialization error: {e}"),
        }

        if backends.is_empty() {
            warn!("No storage backend available, caching disabled");
        }

        Self::with_backends(backends)
    }

    /// Builds a store over explicit backends, in preference order.
    pub fn with_backends(backends: Vec<Box<dyn CacheBackend>>) -> Self {
        Self { backends }
    }

    /// Name of the preferred engine, or `"none"`.
    pub fn backend_name(&self) -> &str {
        self.backends.first().map(|b| b.name()).unwrap_or("none")
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        for backend in &self.backends {
            match backend.get(key, now).await {
                Ok(value) => return value,
                Err(StoreError::Unavailable(e)) => {
                    warn!("{} unavailable for cache read, falling back: {e}", backend.name());
                }
                Err(e) => {
                    error!("Cache retrieval error: {e}");
                    return None;
                }
            }
        }
        None
    }

    pub async fn set(&self, key: &str, value: &str, ttl_minutes: i64) {
        self.set_at(key, value, ttl_minutes, Utc::now()).await
    }

    pub async fn set_at(&self, key: &str, value: &str, ttl_minutes: i64, now: DateTime<Utc>) {
        let entry = CacheEntry::new(key, value, ttl_minutes, now);
        for backend in &self.backends {
            match backend.set(&entry).await {
                Ok(()) => return,
                Err(StoreError::Unavailable(e)) => {
                    warn!("{} unavailable for cache write, falling back: {e}", backend.name());
                }
                Err(e) => {
                    error!("Cache storage error: {e}");
                    return;
                }
            }
        }
    }

    pub async fn log(&self, user_id: &str, action: &str, details: &str) {
        let event = AnalyticsEvent {
            user_id: user_id.to_string(),
            action: action.to_string(),
            details: details.to_string(),
        };
        for backend in &self.backends {
            match backend.log(&event).await {
                Ok(()) => return,
                Err(StoreError::Unavailable(e)) => {
                    warn!("{} unavailable for analytics, falling back: {e}", backend.name());
                }
                Err(e) => {
                    error!("Analytics error: {e}");
                    return;
                }
            }
        }
    }

    /// Removes expired rows from the preferred engine. Returns 0 on failure.
    pub async fn purge_expired(&self) -> u64 {
        let now = Utc::now();
        for backend in &self.backends {
            match backend.purge_expired(now).await {
                Ok(count) => return count,
                Err(StoreError::Unavailable(e)) => {
                    warn!("{} unavailable for purge, falling back: {e}", backend.name());
                }
                Err(e) => {
                    error!("Cache purge error: {e}");
                    return 0;
                }
            }
        }
        0
    }
}
