//! The dual-tier cache store.
//!
//! Reads consult the mirror, then the persistent tier. Every mutation runs
//! under one async write gate, updates both tiers, advances the store
//! watermark and broadcasts a [`ChangeEvent`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use revalid_core::{
    add_duration, compute_payload_hash, CacheOptions, Clock, RevalidResult, StorageError,
    SystemClock, Tag,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::backend::PersistentBackend;
use crate::entry::{CacheEntry, CachedValue, SetOptions};
use crate::mirror::{FastPathMirror, MirrorLookup};
use crate::observe::EntryStream;
use crate::sqlite::SqliteBackend;
use crate::watermark::{ChangeEvent, ChangeScope, Watermark};

/// Keys touched by an invalidation and the watermark it was recorded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationResult {
    /// Union of the keys hit in either tier, sorted.
    pub keys: Vec<String>,
    pub watermark: Watermark,
}

impl InvalidationResult {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Point-in-time store counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: u64,
    pub stale_entries: u64,
    pub expired_entries: u64,
    pub mirror_entries: u64,
}

/// Shared handle to one cache instance.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn PersistentBackend>,
    mirror: Option<FastPathMirror>,
    clock: Arc<dyn Clock>,
    write_gate: Mutex<()>,
    sequence: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("mirror", &self.inner.mirror.as_ref().map(|m| m.capacity()))
            .field("clock", &self.inner.clock)
            .field("sequence", &self.inner.sequence.load(Ordering::Acquire))
            .finish()
    }
}

/// Truncate to the persistent tier's millisecond precision so both tiers
/// agree on every timestamp.
fn storage_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

impl CacheStore {
    /// Open a SQLite-backed store using the system clock.
    pub fn open(options: &CacheOptions) -> RevalidResult<Self> {
        Self::open_with_clock(options, Arc::new(SystemClock))
    }

    pub fn open_with_clock(options: &CacheOptions, clock: Arc<dyn Clock>) -> RevalidResult<Self> {
        options.validate()?;
        let backend = SqliteBackend::open(options)?;
        Ok(Self::with_backend(Arc::new(backend), options, clock))
    }

    /// In-memory SQLite with default options.
    pub fn in_memory() -> RevalidResult<Self> {
        Self::open(&CacheOptions::in_memory())
    }

    /// Build a store over any backend.
    pub fn with_backend(
        backend: Arc<dyn PersistentBackend>,
        options: &CacheOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mirror = options
            .mirror_enabled
            .then(|| FastPathMirror::new(options.mirror_capacity));
        let (changes, _) = broadcast::channel(options.change_channel_capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                backend,
                mirror,
                clock,
                write_gate: Mutex::new(()),
                sequence: AtomicU64::new(0),
                changes,
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn has_mirror(&self) -> bool {
        self.inner.mirror.is_some()
    }

    /// Watermark of the most recent mutation.
    pub fn current_watermark(&self) -> Watermark {
        Watermark::with_timestamp(self.inner.sequence.load(Ordering::Acquire), self.now())
    }

    /// Receive every change published after this call.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// The unexpired entry stored under `key`, without decoding.
    pub async fn get_entry(&self, key: &str) -> RevalidResult<Option<CacheEntry>> {
        Ok(self.lookup(key).await?.map(|(entry, _)| entry))
    }

    async fn lookup(&self, key: &str) -> Result<Option<(CacheEntry, bool)>, StorageError> {
        let now = storage_precision(self.now());
        if let Some(mirror) = &self.inner.mirror {
            match mirror.lookup(key, now)? {
                MirrorLookup::Hit(entry) => {
                    trace!(key, "Mirror hit");
                    return Ok(Some((entry, true)));
                }
                MirrorLookup::Expired => debug!(key, "Mirror entry expired"),
                MirrorLookup::Miss => {}
            }
        }

        let observed = self.inner.sequence.load(Ordering::Acquire);
        let loaded = self.inner.backend.load(key, now).await?;
        match (&loaded, &self.inner.mirror) {
            (Some(entry), Some(mirror)) => {
                // The refill must not overwrite a mutation that committed
                // while the row was being loaded.
                let _gate = self.inner.write_gate.lock().await;
                if self.inner.sequence.load(Ordering::Acquire) == observed {
                    mirror.insert(entry.clone())?;
                } else {
                    trace!(key, "Store changed during load, skipping mirror refill");
                }
            }
            (None, _) => debug!(key, "Cache miss"),
            _ => {}
        }
        Ok(loaded.map(|entry| (entry, false)))
    }

    /// Read and decode the value stored under `key`.
    ///
    /// A payload that no longer decodes as `T` is reported as
    /// [`revalid_core::RevalidError::Decode`], never as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> RevalidResult<Option<CachedValue<T>>> {
        let Some((entry, from_mirror)) = self.lookup(key).await? else {
            return Ok(None);
        };
        let value = entry.decode::<T>()?;
        Ok(Some(CachedValue::new(
            value,
            entry.is_stale(storage_precision(self.now())),
            entry.updated_at,
            from_mirror,
        )))
    }

    pub async fn exists(&self, key: &str) -> RevalidResult<bool> {
        let now = storage_precision(self.now());
        if let Some(mirror) = &self.inner.mirror {
            if let MirrorLookup::Hit(_) = mirror.lookup(key, now)? {
                return Ok(true);
            }
        }
        Ok(self.inner.backend.exists(key, now).await?)
    }

    /// Serialize and store `data` under `key`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        options: &SetOptions,
    ) -> RevalidResult<CacheEntry> {
        let payload = serde_json::to_vec(data).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.set_raw(key, payload, std::any::type_name::<T>(), options)
            .await
    }

    /// Store an already-serialized payload.
    pub async fn set_raw(
        &self,
        key: &str,
        payload: Vec<u8>,
        type_tag: &str,
        options: &SetOptions,
    ) -> RevalidResult<CacheEntry> {
        options.validate()?;

        let _gate = self.inner.write_gate.lock().await;
        let now = storage_precision(self.now());
        let previous = match &self.inner.mirror {
            Some(mirror) => mirror.peek(key)?,
            None => None,
        };
        let (id, created_at) = previous
            .map(|e| (e.id, e.created_at))
            .unwrap_or_else(|| (Uuid::now_v7(), now));

        let entry = CacheEntry {
            id,
            key: key.to_string(),
            payload_hash: compute_payload_hash(&payload),
            payload,
            type_tag: type_tag.to_string(),
            tags: options.tags.clone(),
            created_at,
            updated_at: now,
            stale_at: options.stale_time.map(|d| add_duration(now, d)),
            expires_at: options.cache_time.map(|d| add_duration(now, d)),
            etag: options.etag.clone(),
            invalidated: false,
        };

        if let Some(mirror) = &self.inner.mirror {
            mirror.insert(entry.clone())?;
        }
        let stored = match self.inner.backend.upsert(&entry).await {
            Ok(stored) => stored,
            Err(e) => {
                // Do not leave a value in the mirror that the durable tier rejected.
                if let Some(mirror) = &self.inner.mirror {
                    mirror.remove(key)?;
                }
                return Err(e.into());
            }
        };
        if let Some(mirror) = &self.inner.mirror {
            mirror.insert(stored.clone())?;
        }

        let watermark = self.publish(ChangeScope::Keys(vec![key.to_string()]));
        debug!(key, sequence = watermark.sequence, "Stored cache entry");
        Ok(stored)
    }

    /// Mark every entry whose tags are matched by `tag` as invalidated.
    pub async fn invalidate_tag(&self, tag: &Tag) -> RevalidResult<InvalidationResult> {
        let _gate = self.inner.write_gate.lock().await;
        let mut keys: BTreeSet<String> = BTreeSet::new();
        if let Some(mirror) = &self.inner.mirror {
            keys.extend(mirror.invalidate_matching(tag)?);
        }
        keys.extend(self.inner.backend.mark_invalidated_by_tag(tag).await?);

        let keys: Vec<String> = keys.into_iter().collect();
        let watermark = self.publish_if_changed(&keys);
        debug!(tag = %tag, affected = keys.len(), "Invalidated tag");
        Ok(InvalidationResult { keys, watermark })
    }

    /// Mark a single entry as invalidated.
    pub async fn invalidate_key(&self, key: &str) -> RevalidResult<InvalidationResult> {
        let _gate = self.inner.write_gate.lock().await;
        let in_mirror = match &self.inner.mirror {
            Some(mirror) => mirror.invalidate(key)?,
            None => false,
        };
        let in_backend = self.inner.backend.mark_invalidated(key).await?;

        let keys = if in_mirror || in_backend {
            vec![key.to_string()]
        } else {
            Vec::new()
        };
        let watermark = self.publish_if_changed(&keys);
        debug!(key, found = !keys.is_empty(), "Invalidated key");
        Ok(InvalidationResult { keys, watermark })
    }

    /// Delete `key` from both tiers. Returns whether anything was removed.
    pub async fn remove(&self, key: &str) -> RevalidResult<bool> {
        let _gate = self.inner.write_gate.lock().await;
        let in_mirror = match &self.inner.mirror {
            Some(mirror) => mirror.remove(key)?,
            None => false,
        };
        let in_backend = self.inner.backend.delete(key).await?;
        let removed = in_mirror || in_backend;
        if removed {
            self.publish(ChangeScope::Keys(vec![key.to_string()]));
        }
        Ok(removed)
    }

    /// Delete everything. Returns the number of persistent rows removed.
    pub async fn clear(&self) -> RevalidResult<u64> {
        let _gate = self.inner.write_gate.lock().await;
        if let Some(mirror) = &self.inner.mirror {
            mirror.clear()?;
        }
        let removed = self.inner.backend.delete_all().await?;
        self.publish(ChangeScope::All);
        info!(removed, "Cleared cache");
        Ok(removed)
    }

    /// Delete expired entries from both tiers. Returns the number of
    /// distinct keys removed.
    pub async fn collect_garbage(&self) -> RevalidResult<u64> {
        let _gate = self.inner.write_gate.lock().await;
        let now = storage_precision(self.now());
        let mut keys: BTreeSet<String> = BTreeSet::new();
        if let Some(mirror) = &self.inner.mirror {
            keys.extend(mirror.remove_expired(now)?);
        }
        keys.extend(self.inner.backend.delete_expired(now).await?);

        let keys: Vec<String> = keys.into_iter().collect();
        let removed = keys.len() as u64;
        if removed > 0 {
            self.publish(ChangeScope::Keys(keys));
            info!(removed, "Collected expired cache entries");
        } else {
            trace!("No expired cache entries");
        }
        Ok(removed)
    }

    /// Stream the entry's state now and after every change to it.
    pub fn observe(&self, key: impl Into<String>) -> EntryStream {
        EntryStream::spawn(self.clone(), key.into())
    }

    pub async fn stats(&self) -> RevalidResult<StoreStats> {
        let backend = self.inner.backend.stats(storage_precision(self.now())).await?;
        let mirror_entries = match &self.inner.mirror {
            Some(mirror) => mirror.len()? as u64,
            None => 0,
        };
        Ok(StoreStats {
            total_entries: backend.total_entries,
            stale_entries: backend.stale_entries,
            expired_entries: backend.expired_entries,
            mirror_entries,
        })
    }

    fn publish_if_changed(&self, keys: &[String]) -> Watermark {
        if keys.is_empty() {
            self.current_watermark()
        } else {
            self.publish(ChangeScope::Keys(keys.to_vec()))
        }
    }

    fn publish(&self, scope: ChangeScope) -> Watermark {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let watermark = Watermark::with_timestamp(sequence, self.now());
        // No receivers is normal.
        let _ = self.inner.changes.send(ChangeEvent { scope, watermark });
        watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStats;
    use async_trait::async_trait;
    use revalid_core::{ManualClock, RevalidError};
    use serde::Deserialize;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn store_with_clock(options: CacheOptions) -> (CacheStore, ManualClock) {
        let clock = ManualClock::starting_now();
        let store =
            CacheStore::open_with_clock(&options, Arc::new(clock.clone())).expect("open store");
        (store, clock)
    }

    /// SQLite backend whose next `load` parks after reading its row until
    /// the test resumes it.
    struct PausingBackend {
        inner: SqliteBackend,
        armed: AtomicBool,
        parked: Notify,
        resume: Semaphore,
    }

    impl PausingBackend {
        fn new() -> Self {
            Self {
                inner: SqliteBackend::open_in_memory().expect("open backend"),
                armed: AtomicBool::new(false),
                parked: Notify::new(),
                resume: Semaphore::new(0),
            }
        }

        fn pause_next_load(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        async fn wait_until_parked(&self) {
            self.parked.notified().await;
        }

        fn resume_load(&self) {
            self.resume.add_permits(1);
        }
    }

    #[async_trait]
    impl PersistentBackend for PausingBackend {
        async fn load(
            &self,
            key: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<CacheEntry>, StorageError> {
            let loaded = self.inner.load(key, now).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.resume.acquire().await.expect("semaphore open").forget();
            }
            Ok(loaded)
        }

        async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
            self.inner.exists(key, now).await
        }

        async fn upsert(&self, entry: &CacheEntry) -> Result<CacheEntry, StorageError> {
            self.inner.upsert(entry).await
        }

        async fn mark_invalidated_by_tag(&self, tag: &Tag) -> Result<Vec<String>, StorageError> {
            self.inner.mark_invalidated_by_tag(tag).await
        }

        async fn mark_invalidated(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.mark_invalidated(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }

        async fn delete_all(&self) -> Result<u64, StorageError> {
            self.inner.delete_all().await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
            self.inner.delete_expired(now).await
        }

        async fn stats(&self, now: DateTime<Utc>) -> Result<BackendStats, StorageError> {
            self.inner.stats(now).await
        }
    }

    /// A store whose single-slot mirror no longer holds `k = 1`, so the next
    /// read of `k` goes to the backend.
    async fn store_with_evicted_key() -> (CacheStore, Arc<PausingBackend>) {
        let backend = Arc::new(PausingBackend::new());
        let clock = ManualClock::starting_now();
        let options = CacheOptions::in_memory().with_mirror_capacity(1);
        let store = CacheStore::with_backend(
            Arc::clone(&backend) as Arc<dyn PersistentBackend>,
            &options,
            Arc::new(clock.clone()),
        );
        store.set("k", &1u32, &SetOptions::new()).await.expect("set k");
        clock.advance(Duration::from_secs(1));
        store
            .set("other", &0u32, &SetOptions::new())
            .await
            .expect("set other");
        clock.advance(Duration::from_secs(1));
        (store, backend)
    }

    fn tags(values: &[&str]) -> revalid_core::TagSet {
        values
            .iter()
            .map(|v| Tag::parse(v).expect("tag"))
            .collect()
    }

    #[tokio::test]
    async fn test_read_after_write_from_mirror() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        let user = User {
            id: 1,
            name: "ada".to_string(),
        };
        store
            .set("user:1", &user, &SetOptions::new())
            .await
            .expect("set");

        let cached = store
            .get::<User>("user:1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cached.value(), &user);
        assert!(cached.was_mirror_hit());
        assert!(!cached.is_stale());
    }

    #[tokio::test]
    async fn test_reads_without_mirror_hit_backend() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory().with_mirror(false));
        store.set("n", &7u32, &SetOptions::new()).await.expect("set");
        let cached = store.get::<u32>("n").await.expect("get").expect("present");
        assert!(!cached.was_mirror_hit());
        assert_eq!(cached.into_value(), 7);
        assert_eq!(store.stats().await.expect("stats").mirror_entries, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_is_an_error() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        store
            .set("k", &"text", &SetOptions::new())
            .await
            .expect("set");
        let err = store.get::<u32>("k").await.expect_err("type mismatch");
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn test_invalid_lifetime_rejected() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        let options = SetOptions::new()
            .with_stale_time(Duration::from_secs(20))
            .with_cache_time(Duration::from_secs(10));
        let err = store.set("k", &1u32, &options).await.expect_err("rejected");
        assert!(matches!(err, RevalidError::Validation(_)));
        assert!(!store.exists("k").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_watermark_advances_on_mutation_only() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        let start = store.current_watermark();
        store.set("k", &1u32, &SetOptions::new()).await.expect("set");
        let after_set = store.current_watermark();
        assert!(after_set.is_newer_than(&start));

        let miss = store
            .invalidate_tag(&Tag::parse("nothing").expect("tag"))
            .await
            .expect("invalidate");
        assert!(miss.is_empty());
        assert_eq!(miss.watermark.sequence, after_set.sequence);

        let hit = store.invalidate_key("k").await.expect("invalidate");
        assert_eq!(hit.keys, vec!["k".to_string()]);
        assert!(hit.watermark.is_newer_than(&after_set));
    }

    #[tokio::test]
    async fn test_change_events_carry_keys() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        let mut changes = store.subscribe_changes();
        let options = SetOptions::new().with_tags(tags(&["users"]));
        store.set("a", &1u32, &options).await.expect("set");
        store
            .invalidate_tag(&Tag::parse("users").expect("tag"))
            .await
            .expect("invalidate");
        store.clear().await.expect("clear");

        let first = changes.recv().await.expect("set event");
        assert_eq!(first.scope, ChangeScope::Keys(vec!["a".to_string()]));
        let second = changes.recv().await.expect("invalidate event");
        assert!(second.watermark.is_newer_than(&first.watermark));
        assert_eq!(changes.recv().await.expect("clear").scope, ChangeScope::All);
    }

    #[tokio::test]
    async fn test_expired_mirror_entry_falls_through() {
        let (store, clock) = store_with_clock(CacheOptions::in_memory());
        let options = SetOptions::new()
            .with_stale_time(Duration::from_secs(1))
            .with_cache_time(Duration::from_secs(2));
        store.set("k", &1u32, &options).await.expect("set");
        clock.advance(Duration::from_secs(3));

        assert!(store.get::<u32>("k").await.expect("get").is_none());
        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.mirror_entries, 0);
        assert_eq!(stats.expired_entries, 1);
    }

    #[tokio::test]
    async fn test_write_during_backend_read_is_not_overwritten() {
        let (store, backend) = store_with_evicted_key().await;
        backend.pause_next_load();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get::<u32>("k").await })
        };
        backend.wait_until_parked().await;

        store.set("k", &2u32, &SetOptions::new()).await.expect("set");
        backend.resume_load();
        let read = reader.await.expect("join").expect("get").expect("present");
        assert_eq!(read.into_value(), 1);

        let cached = store.get::<u32>("k").await.expect("get").expect("present");
        assert_eq!(cached.into_value(), 2);
        let durable = backend
            .inner
            .load("k", store.now())
            .await
            .expect("load")
            .expect("present");
        assert_eq!(durable.decode::<u32>().expect("decode"), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_backend_read_stays_visible() {
        let (store, backend) = store_with_evicted_key().await;
        backend.pause_next_load();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get::<u32>("k").await })
        };
        backend.wait_until_parked().await;

        let hit = store.invalidate_key("k").await.expect("invalidate");
        assert_eq!(hit.keys, vec!["k".to_string()]);
        backend.resume_load();
        reader.await.expect("join").expect("get").expect("present");

        let cached = store.get::<u32>("k").await.expect("get").expect("present");
        assert!(cached.is_stale());
        assert_eq!(cached.into_value(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_backend_read_refills_mirror() {
        let (store, _backend) = store_with_evicted_key().await;
        let first = store.get::<u32>("k").await.expect("get").expect("present");
        assert!(!first.was_mirror_hit());
        let second = store.get::<u32>("k").await.expect("get").expect("present");
        assert!(second.was_mirror_hit());
        assert_eq!(second.into_value(), 1);
    }

    #[tokio::test]
    async fn test_expiry_agrees_across_tiers_within_a_millisecond() {
        let (store, clock) = store_with_clock(CacheOptions::in_memory());
        let options = SetOptions::new()
            .with_stale_time(Duration::from_secs(1))
            .with_cache_time(Duration::from_secs(2));
        store.set("k", &1u32, &options).await.expect("set");
        let expires_at = store
            .get_entry("k")
            .await
            .expect("get")
            .expect("present")
            .expires_at
            .expect("expiry");

        clock.set(expires_at + chrono::Duration::microseconds(500));
        let cached = store.get::<u32>("k").await.expect("get").expect("present");
        assert!(cached.was_mirror_hit());
        assert!(store.exists("k").await.expect("exists"));

        clock.set(expires_at + chrono::Duration::milliseconds(1));
        assert!(store.get::<u32>("k").await.expect("get").is_none());
        assert!(store.get::<u32>("k").await.expect("get").is_none());
        assert!(!store.exists("k").await.expect("exists"));
        assert_eq!(store.stats().await.expect("stats").mirror_entries, 0);
    }

    #[tokio::test]
    async fn test_remove_deletes_both_tiers() {
        let (store, _clock) = store_with_clock(CacheOptions::in_memory());
        store.set("k", &1u32, &SetOptions::new()).await.expect("set");
        assert!(store.remove("k").await.expect("remove"));
        assert!(!store.remove("k").await.expect("remove"));
        assert!(store.get_entry("k").await.expect("get").is_none());
    }
}
