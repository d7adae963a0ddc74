//! Versioned schema migrations for the SQLite tier.
//!
//! Each migration runs in its own transaction together with the row that
//! records it in `schema_migrations`, so a failed migration leaves no trace
//! and re-running the list is a no-op.

use std::collections::HashSet;

use chrono::Utc;
use revalid_core::StorageError;
use rusqlite::{params, Connection};
use tracing::{debug, info};

/// One schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Applied in order. Never edit a released entry; append a new one.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_query_cache",
        sql: "CREATE TABLE IF NOT EXISTS query_cache (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                payload BLOB NOT NULL,
                payload_hash TEXT NOT NULL,
                type_tag TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                stale_at INTEGER,
                expires_at INTEGER,
                invalidated INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_query_cache_tags ON query_cache(tags);
            CREATE INDEX IF NOT EXISTS idx_query_cache_expires_at ON query_cache(expires_at);",
    },
    Migration {
        version: 2,
        name: "add_etag_and_staleness_index",
        sql: "ALTER TABLE query_cache ADD COLUMN etag TEXT;
            CREATE INDEX IF NOT EXISTS idx_query_cache_staleness
                ON query_cache(stale_at, invalidated);",
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Versions already recorded in `schema_migrations`, ascending.
pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>, StorageError> {
    ensure_migrations_table(conn)?;
    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations ORDER BY version")
        .map_err(|e| StorageError::backend("applied_versions", e))?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))
        .map_err(|e| StorageError::backend("applied_versions", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::backend("applied_versions", e))?;
    Ok(versions)
}

/// Apply every pending migration. Returns the versions applied by this call.
pub fn run_migrations(conn: &mut Connection) -> Result<Vec<u32>, StorageError> {
    let applied: HashSet<u32> = applied_versions(conn)?.into_iter().collect();
    let mut newly_applied = Vec::new();

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            debug!(version = migration.version, "Migration already applied");
            continue;
        }
        apply(conn, migration)?;
        info!(
            version = migration.version,
            name = migration.name,
            "Applied cache schema migration"
        );
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

fn ensure_migrations_table(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .map(|_| ())
    .map_err(|e| StorageError::backend("create_schema_migrations", e))
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<(), StorageError> {
    let fail = |e: rusqlite::Error| StorageError::Migration {
        version: migration.version,
        reason: e.to_string(),
    };

    let tx = conn.transaction().map_err(fail)?;
    tx.execute_batch(migration.sql).map_err(fail)?;
    tx.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, Utc::now().timestamp_millis()],
    )
    .map_err(fail)?;
    tx.commit().map_err(fail)
}
