//! revalid Test Utilities
//!
//! Shared test infrastructure for the revalid workspace:
//! - Scripted fetchers with call counting and release gates
//! - A fault-injecting persistent backend
//! - Store and client fixtures
//! - Proptest generators for tags

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};

pub use revalid_client::{Fetcher, QueryClient, QueryData, QueryObserver, QueryState};
pub use revalid_core::{CacheOptions, FetchError, ManualClock, StorageError, Tag, TagSet};
pub use revalid_storage::{BackendStats, CacheEntry, CacheStore, PersistentBackend, SqliteBackend};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SCRIPTED FETCHER
// ============================================================================

struct Script<T> {
    calls: AtomicU32,
    queued: Mutex<VecDeque<Result<T, FetchError>>>,
    fallback: Mutex<Option<Result<T, FetchError>>>,
    gate: Option<Semaphore>,
    called: Notify,
}

/// A [`Fetcher`] that replays queued results, then repeats its fallback.
///
/// Clones share the script and the call counter. A gated fetcher holds
/// every call until [`ScriptedFetcher::release`] hands out a permit.
pub struct ScriptedFetcher<T> {
    script: Arc<Script<T>>,
}

impl<T> Clone for ScriptedFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T> std::fmt::Debug for ScriptedFetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedFetcher")
            .field("calls", &self.script.calls.load(Ordering::SeqCst))
            .field("gated", &self.script.gate.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> ScriptedFetcher<T> {
    fn with_gate(gate: Option<Semaphore>) -> Self {
        Self {
            script: Arc::new(Script {
                calls: AtomicU32::new(0),
                queued: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                gate,
                called: Notify::new(),
            }),
        }
    }

    /// No results queued; every call fails until some are.
    pub fn new() -> Self {
        Self::with_gate(None)
    }

    /// Every call returns `value`.
    pub fn always(value: T) -> Self {
        let fetcher = Self::new();
        fetcher.set_fallback(Ok(value));
        fetcher
    }

    /// Every call waits for a permit from [`ScriptedFetcher::release`].
    pub fn gated() -> Self {
        Self::with_gate(Some(Semaphore::new(0)))
    }

    pub fn push_ok(&self, value: T) -> &Self {
        lock(&self.script.queued).push_back(Ok(value));
        self
    }

    pub fn push_err(&self, message: &str) -> &Self {
        lock(&self.script.queued).push_back(Err(FetchError::new(message)));
        self
    }

    /// Result used once the queue is empty.
    pub fn set_fallback(&self, result: Result<T, FetchError>) {
        *lock(&self.script.fallback) = Some(result);
    }

    /// Calls started so far, including ones still waiting at the gate.
    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Let `permits` gated calls complete.
    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.script.gate {
            gate.add_permits(permits);
        }
    }

    /// Wait until at least `count` calls have started.
    pub async fn wait_for_calls(&self, count: u32) {
        loop {
            let called = self.script.called.notified();
            if self.calls() >= count {
                return;
            }
            called.await;
        }
    }

    fn next_result(&self, call: u32) -> Result<T, FetchError> {
        if let Some(result) = lock(&self.script.queued).pop_front() {
            return result;
        }
        let fallback = lock(&self.script.fallback).clone();
        fallback.unwrap_or_else(|| Err(FetchError::new(format!("script exhausted at call {call}"))))
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ScriptedFetcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Fetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self) -> Result<T, FetchError> {
        let call = self.script.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.called.notify_waiters();
        if let Some(gate) = &self.script.gate {
            let permit = gate.acquire().await.map_err(|e| FetchError::from_error(&e))?;
            permit.forget();
        }
        self.next_result(call)
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// In-memory SQLite backend whose reads and writes can be made to fail.
#[derive(Debug)]
pub struct FailingBackend {
    inner: SqliteBackend,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingBackend {
    /// A working backend; flip the switches to inject failures.
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            inner: SqliteBackend::open_in_memory()?,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, switch: &AtomicBool, operation: &str) -> Result<(), StorageError> {
        if switch.load(Ordering::SeqCst) {
            return Err(StorageError::backend(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentBackend for FailingBackend {
    async fn load(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StorageError> {
        self.check(&self.fail_reads, "load")?;
        self.inner.load(key, now).await
    }

    async fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        self.check(&self.fail_reads, "exists")?;
        self.inner.exists(key, now).await
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<CacheEntry, StorageError> {
        self.check(&self.fail_writes, "upsert")?;
        self.inner.upsert(entry).await
    }

    async fn mark_invalidated_by_tag(&self, tag: &Tag) -> Result<Vec<String>, StorageError> {
        self.check(&self.fail_writes, "mark_invalidated_by_tag")?;
        self.inner.mark_invalidated_by_tag(tag).await
    }

    async fn mark_invalidated(&self, key: &str) -> Result<bool, StorageError> {
        self.check(&self.fail_writes, "mark_invalidated")?;
        self.inner.mark_invalidated(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(key).await
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        self.check(&self.fail_writes, "delete_all")?;
        self.inner.delete_all().await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        self.check(&self.fail_writes, "delete_expired")?;
        self.inner.delete_expired(now).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<BackendStats, StorageError> {
        self.check(&self.fail_reads, "stats")?;
        self.inner.stats(now).await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores and clients.

    use super::*;
    use std::time::Duration;

    /// In-memory store on the system clock.
    pub fn memory_store() -> CacheStore {
        CacheStore::in_memory().expect("in-memory store opens")
    }

    /// In-memory store driven by a manual clock.
    pub fn clocked_memory_store() -> (CacheStore, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = CacheStore::open_with_clock(&CacheOptions::in_memory(), Arc::new(clock.clone()))
            .expect("in-memory store opens");
        (store, clock)
    }

    /// Store over a [`FailingBackend`] with the mirror disabled, so every
    /// read reaches the backend.
    pub fn failing_store() -> (CacheStore, Arc<FailingBackend>) {
        let backend = Arc::new(FailingBackend::new().expect("in-memory backend opens"));
        let options = CacheOptions::in_memory().with_mirror(false);
        let store = CacheStore::with_backend(
            backend.clone(),
            &options,
            Arc::new(revalid_core::SystemClock),
        );
        (store, backend)
    }

    /// Client over a fresh in-memory store.
    pub fn memory_client() -> QueryClient {
        QueryClient::new(memory_store())
    }

    /// Wait for an observer state satisfying `ready`, failing the test after
    /// five seconds.
    pub async fn wait_for_state<T: QueryData>(
        observer: &QueryObserver<T>,
        mut ready: impl FnMut(&QueryState<T>) -> bool,
    ) -> QueryState<T> {
        let mut rx = observer.subscribe();
        let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| ready(state))).await;
        match reached {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => panic!("observer for {} dropped while waiting", observer.key()),
            Err(_) => panic!(
                "observer for {} never reached the expected state; last: status={:?} fetch={:?}",
                observer.key(),
                observer.status(),
                observer.fetch_status()
            ),
        }
    }

    /// Install an env-filtered subscriber once per test binary.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tags.

    use super::*;
    use proptest::prelude::*;

    /// A valid tag segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9:_-]{0,7}"
    }

    /// A tag of one to four segments.
    pub fn arb_tag() -> impl Strategy<Value = Tag> {
        prop::collection::vec(arb_segment(), 1..5)
            .prop_map(|segments| Tag::from_segments(segments).expect("generated segments are valid"))
    }

    /// A strict descendant of `parent`.
    pub fn arb_descendant(parent: Tag) -> impl Strategy<Value = Tag> {
        prop::collection::vec(arb_segment(), 1..3).prop_map(move |extra| {
            let mut segments = parent.segments().to_vec();
            segments.extend(extra);
            Tag::from_segments(segments).expect("generated segments are valid")
        })
    }

    pub fn arb_tag_set() -> impl Strategy<Value = TagSet> {
        prop::collection::vec(arb_tag(), 0..5).prop_map(|tags| tags.into_iter().collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
