//! In-process fast-path mirror of the persistent tier.
//!
//! Holds copies of recently written or read entries so hot reads skip
//! SQLite. The mirror is never authoritative: a miss always falls through
//! to the persistent tier.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use revalid_core::{StorageError, Tag};
use tracing::trace;

use crate::entry::CacheEntry;

/// Result of a mirror lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorLookup {
    Hit(CacheEntry),
    /// The entry was present but expired; it has been evicted.
    Expired,
    Miss,
}

/// Bounded map of key to entry.
#[derive(Debug)]
pub struct FastPathMirror {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
}

impl FastPathMirror {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lookup(&self, key: &str, now: DateTime<Utc>) -> Result<MirrorLookup, StorageError> {
        {
            let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
            match entries.get(key) {
                None => return Ok(MirrorLookup::Miss),
                Some(entry) if !entry.is_expired(now) => return Ok(MirrorLookup::Hit(entry.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        // Re-check under the write lock; a concurrent write may have refreshed it.
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                trace!(key, "Evicted expired mirror entry");
                Ok(MirrorLookup::Expired)
            }
            Some(entry) => Ok(MirrorLookup::Hit(entry.clone())),
            None => Ok(MirrorLookup::Miss),
        }
    }

    /// The stored entry regardless of expiry.
    pub fn peek(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    /// Insert or replace, evicting the least recently updated entry when full.
    pub fn insert(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        if !entries.contains_key(&entry.key) && entries.len() >= self.capacity {
            let oldest = entries
                .values()
                .min_by_key(|e| e.updated_at)
                .map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                trace!(key = %oldest, "Evicted mirror entry at capacity");
            }
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Flag every entry carrying a tag matched by `tag`. Returns their keys.
    pub fn invalidate_matching(&self, tag: &Tag) -> Result<Vec<String>, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut keys = Vec::new();
        for entry in entries.values_mut() {
            if entry.tags.contains_match(tag) {
                entry.invalidated = true;
                keys.push(entry.key.clone());
            }
        }
        Ok(keys)
    }

    pub fn invalidate(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.invalidated = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.remove(key).is_some())
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    pub fn remove_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        let expired: Vec<String> = entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        Ok(expired)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.len().map(|len| len == 0)
    }
}
