//! SQLite persistent tier.
//!
//! One `query_cache` table keyed by cache key. Timestamps are stored as
//! epoch milliseconds and tags in [`TagSet::encode`] form, which lets tag
//! invalidation pre-filter rows with `instr` before the exact prefix check.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revalid_core::{CacheOptions, StorageError, StorageLocation, Tag, TagSet};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendStats, PersistentBackend};
use crate::entry::CacheEntry;
use crate::migrations::{applied_versions, run_migrations};

const ENTRY_COLUMNS: &str = "id, key, payload, payload_hash, type_tag, tags, created_at, \
     updated_at, stale_at, expires_at, etag, invalidated";

const UPSERT_SQL: &str = "INSERT INTO query_cache (id, key, payload, payload_hash, type_tag, \
     tags, created_at, updated_at, stale_at, expires_at, etag, invalidated)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
     ON CONFLICT(key) DO UPDATE SET
         payload = excluded.payload,
         payload_hash = excluded.payload_hash,
         type_tag = excluded.type_tag,
         tags = excluded.tags,
         updated_at = excluded.updated_at,
         stale_at = excluded.stale_at,
         expires_at = excluded.expires_at,
         etag = excluded.etag,
         invalidated = 0";

/// SQLite-backed [`PersistentBackend`].
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database described by `options` and
    /// bring its schema up to date.
    pub fn open(options: &CacheOptions) -> Result<Self, StorageError> {
        let mut conn = match &options.location {
            StorageLocation::InMemory => Connection::open_in_memory(),
            StorageLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::backend("create_dir", e))?;
                }
                Connection::open(path)
            }
        }
        .map_err(|e| StorageError::backend("open", e))?;

        configure(&conn, options)?;
        let applied = run_migrations(&mut conn)?;

        info!(
            location = ?options.location,
            migrations_applied = applied.len(),
            "Opened SQLite cache tier"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(&CacheOptions::in_memory())
    }

    /// Schema versions recorded in this database.
    pub fn schema_versions(&self) -> Result<Vec<u32>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        applied_versions(&conn)
    }

    /// Run `f` against the raw connection.
    ///
    /// Maintenance hook; bypasses the cache's change notifications.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R, StorageError> {
        self.with_conn("with_connection", f)
    }

    fn with_conn<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&mut conn).map_err(|e| {
            warn!(operation, error = %e, "SQLite operation failed");
            StorageError::backend(operation, e)
        })
    }
}

fn configure(conn: &Connection, options: &CacheOptions) -> Result<(), StorageError> {
    if matches!(options.location, StorageLocation::File(_)) {
        let mode = if options.wal { "WAL" } else { "DELETE" };
        let applied: String = conn
            .pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))
            .map_err(|e| StorageError::backend("journal_mode", e))?;
        debug!(journal_mode = %applied, "Configured journal mode");
    }

    if let Some(max_bytes) = options.max_size_bytes {
        let page_size: i64 = conn
            .pragma_query_value(None, "page_size", |row| row.get(0))
            .map_err(|e| StorageError::backend("page_size", e))?;
        let max_pages = i64::try_from(max_bytes)
            .unwrap_or(i64::MAX)
            .checked_div(page_size.max(1))
            .unwrap_or(1)
            .max(1);
        let applied: i64 = conn
            .pragma_update_and_check(None, "max_page_count", max_pages, |row| row.get(0))
            .map_err(|e| StorageError::backend("max_page_count", e))?;
        debug!(max_page_count = applied, page_size, "Configured size limit");
    }

    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn timestamp(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(column, format!("timestamp {ms} out of range")))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let id: String = row.get(0)?;
    let tags: String = row.get(5)?;
    let stale_at: Option<i64> = row.get(8)?;
    let expires_at: Option<i64> = row.get(9)?;

    Ok(CacheEntry {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        key: row.get(1)?,
        payload: row.get(2)?,
        payload_hash: row.get(3)?,
        type_tag: row.get(4)?,
        tags: TagSet::decode(&tags).map_err(|e| conversion_error(5, e))?,
        created_at: timestamp(6, row.get(6)?)?,
        updated_at: timestamp(7, row.get(7)?)?,
        stale_at: stale_at.map(|ms| timestamp(8, ms)).transpose()?,
        expires_at: expires_at.map(|ms| timestamp(9, ms)).transpose()?,
        etag: row.get(10)?,
        invalidated: row.get(11)?,
    })
}

#[async_trait]
impl PersistentBackend for SqliteBackend {
    async fn load(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StorageError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM query_cache
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at >= ?2)"
        );
        self.with_conn("load", |conn| {
            conn.query_row(&sql, params![key, millis(now)], row_to_entry)
                .optional()
        })
    }

    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        self.with_conn("exists", |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM query_cache
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at >= ?2))",
                params![key, millis(now)],
                |row| row.get(0),
            )
        })
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<CacheEntry, StorageError> {
        let select = format!("SELECT {ENTRY_COLUMNS} FROM query_cache WHERE key = ?1");
        self.with_conn("upsert", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                UPSERT_SQL,
                params![
                    entry.id.to_string(),
                    entry.key,
                    entry.payload,
                    entry.payload_hash,
                    entry.type_tag,
                    entry.tags.encode(),
                    millis(entry.created_at),
                    millis(entry.updated_at),
                    entry.stale_at.map(millis),
                    entry.expires_at.map(millis),
                    entry.etag,
                ],
            )?;
            let stored = tx.query_row(&select, params![entry.key], row_to_entry)?;
            tx.commit()?;
            Ok(stored)
        })
    }

    async fn mark_invalidated_by_tag(&self, tag: &Tag) -> Result<Vec<String>, StorageError> {
        let needle = tag.search_needle();
        self.with_conn("mark_invalidated_by_tag", |conn| {
            let tx = conn.transaction()?;
            let candidates: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare("SELECT key, tags FROM query_cache WHERE instr(tags, ?1) > 0")?;
                let rows = stmt.query_map(params![needle], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut keys = Vec::new();
            for (key, encoded) in candidates {
                let tags = TagSet::decode(&encoded).map_err(|e| conversion_error(1, e))?;
                // `instr` also hits sibling segments sharing a prefix ("user" in "users").
                if tags.contains_match(tag) {
                    tx.execute(
                        "UPDATE query_cache SET invalidated = 1 WHERE key = ?1",
                        params![key],
                    )?;
                    keys.push(key);
                }
            }
            tx.commit()?;
            Ok(keys)
        })
    }

    async fn mark_invalidated(&self, key: &str) -> Result<bool, StorageError> {
        self.with_conn("mark_invalidated", |conn| {
            conn.execute(
                "UPDATE query_cache SET invalidated = 1 WHERE key = ?1",
                params![key],
            )
            .map(|changed| changed > 0)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.with_conn("delete", |conn| {
            conn.execute("DELETE FROM query_cache WHERE key = ?1", params![key])
                .map(|changed| changed > 0)
        })
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        self.with_conn("delete_all", |conn| {
            conn.execute("DELETE FROM query_cache", [])
                .map(|changed| changed as u64)
        })
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        self.with_conn("delete_expired", |conn| {
            let tx = conn.transaction()?;
            let keys: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT key FROM query_cache
                     WHERE expires_at IS NOT NULL AND expires_at < ?1",
                )?;
                let rows = stmt.query_map(params![millis(now)], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            tx.execute(
                "DELETE FROM query_cache WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![millis(now)],
            )?;
            tx.commit()?;
            Ok(keys)
        })
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<BackendStats, StorageError> {
        self.with_conn("stats", |conn| {
            conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE
                        WHEN (expires_at IS NULL OR expires_at >= ?1)
                         AND (invalidated = 1 OR (stale_at IS NOT NULL AND stale_at < ?1))
                        THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE
                        WHEN expires_at IS NOT NULL AND expires_at < ?1
                        THEN 1 ELSE 0 END), 0)
                 FROM query_cache",
                params![millis(now)],
                |row| {
                    Ok(BackendStats {
                        total_entries: row.get::<_, i64>(0)?.max(0) as u64,
                        stale_entries: row.get::<_, i64>(1)?.max(0) as u64,
                        expired_entries: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                },
            )
        })
    }
}
