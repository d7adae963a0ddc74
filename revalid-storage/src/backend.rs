//! Persistent tier abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revalid_core::{StorageError, Tag};

use crate::entry::CacheEntry;

/// Point-in-time counts from the persistent tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub total_entries: u64,
    /// Unexpired entries that are invalidated or past `stale_at`.
    pub stale_entries: u64,
    pub expired_entries: u64,
}

/// The authoritative, durable tier of the cache.
///
/// Implementations must make every method atomic with respect to the others.
/// Entries whose `expires_at` has passed are never returned by reads, even
/// before garbage collection removes them.
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// Load an unexpired entry.
    async fn load(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StorageError>;

    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Insert or replace the entry stored under `entry.key`.
    ///
    /// An existing row keeps its `id` and `created_at`; everything else is
    /// replaced and `invalidated` is cleared. Returns the row as stored.
    async fn upsert(&self, entry: &CacheEntry) -> Result<CacheEntry, StorageError>;

    /// Flag every entry carrying a tag matched by `tag`. Returns their keys.
    async fn mark_invalidated_by_tag(&self, tag: &Tag) -> Result<Vec<String>, StorageError>;

    /// Flag one entry. Returns whether it existed.
    async fn mark_invalidated(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete every entry. Returns the number removed.
    async fn delete_all(&self) -> Result<u64, StorageError>;

    /// Delete entries expired at `now`. Returns their keys.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<BackendStats, StorageError>;
}
