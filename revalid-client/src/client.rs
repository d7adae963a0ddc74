//! The client coordinator.
//!
//! A [`QueryClient`] owns one [`CacheStore`] and one [`InvalidationTracker`]
//! and keeps a non-owning registry of started observers. Invalidations run
//! inside the tracker so hooks that invalidate further targets cannot loop
//! forever, and each affected observer is asked to refresh exactly once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use revalid_core::{
    key_identifier, tag_identifier, InvalidationTracker, QueryOptions, RevalidConfig, RevalidResult,
    Tag, TrackerConfig, TrackerStats,
};
use revalid_storage::{CacheStore, InvalidationResult, SetOptions, StoreStats, Watermark};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::events::EventSources;
use crate::fetcher::{fetch_with_retry, Fetcher, QueryData};
use crate::gc::{self, GarbageCollectorHandle};
use crate::observer::QueryObserver;
use crate::registry::ObserverRegistry;

tokio::task_local! {
    // Chain of the invalidation call tree the current task is part of.
    static INVALIDATION_CHAIN: Arc<InvalidationTracker>;
}

/// What to invalidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
    /// Every entry carrying the tag or one of its descendants.
    Tag(Tag),
    Key(String),
}

impl InvalidationTarget {
    pub fn tag(tag: Tag) -> Self {
        Self::Tag(tag)
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Identifier used on the invalidation chain.
    pub fn identifier(&self) -> String {
        match self {
            Self::Tag(tag) => tag_identifier(tag),
            Self::Key(key) => key_identifier(key),
        }
    }
}

impl fmt::Display for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Applied {
        /// Keys marked stale, sorted.
        keys: Vec<String>,
        watermark: Watermark,
        /// Observers that started or joined a fetch.
        refetched: usize,
    },
    /// Dropped by the cycle or depth guard.
    Skipped,
}

impl InvalidationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn keys(&self) -> &[String] {
        match self {
            Self::Applied { keys, .. } => keys,
            Self::Skipped => &[],
        }
    }
}

/// Runs after an invalidation has reached the store and observers, still
/// inside its tracker scope. Invalidations issued from here nest in the same
/// chain.
#[async_trait]
pub trait InvalidationHook: Send + Sync {
    async fn after_invalidation(
        &self,
        client: &QueryClient,
        target: &InvalidationTarget,
        keys: &[String],
    ) -> RevalidResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub store: StoreStats,
    pub tracker: TrackerStats,
    pub live_observers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    pub removed_entries: u64,
    pub pruned_registrations: usize,
}

pub(crate) struct ClientInner {
    store: CacheStore,
    tracker: InvalidationTracker,
    registry: ObserverRegistry,
    defaults: QueryOptions,
    events: EventSources,
    hooks: RwLock<Vec<Arc<dyn InvalidationHook>>>,
    /// Keys with a background refresh in flight.
    refreshing: Mutex<HashSet<String>>,
}

impl ClientInner {
    pub(crate) fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }
}

/// Marks `key` as refreshing until dropped.
struct RefreshSlot {
    inner: Arc<ClientInner>,
    key: String,
}

impl RefreshSlot {
    fn claim(inner: &Arc<ClientInner>, key: &str) -> Option<Self> {
        let mut refreshing = inner.refreshing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        refreshing.insert(key.to_string()).then(|| Self {
            inner: Arc::clone(inner),
            key: key.to_string(),
        })
    }
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        let mut refreshing = self.inner.refreshing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        refreshing.remove(&self.key);
    }
}

pub struct QueryClientBuilder {
    store: CacheStore,
    tracker: TrackerConfig,
    defaults: QueryOptions,
    events: EventSources,
    hooks: Vec<Arc<dyn InvalidationHook>>,
}

impl QueryClientBuilder {
    pub fn tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker = config;
        self
    }

    /// Options for queries that do not bring their own.
    pub fn default_options(mut self, options: QueryOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn event_sources(mut self, events: EventSources) -> Self {
        self.events = events;
        self
    }

    pub fn hook(mut self, hook: impl InvalidationHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> RevalidResult<QueryClient> {
        self.tracker.validate()?;
        self.defaults.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> QueryClient {
        QueryClient {
            inner: Arc::new(ClientInner {
                store: self.store,
                tracker: InvalidationTracker::new(self.tracker),
                registry: ObserverRegistry::default(),
                defaults: self.defaults,
                events: self.events,
                hooks: RwLock::new(self.hooks),
                refreshing: Mutex::new(HashSet::new()),
            }),
        }
    }
}

/// Entry point for fetching, observing and invalidating cached queries.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.inner.store)
            .field("live_observers", &self.inner.registry.live_count())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    /// A client with default query options and a permissive tracker.
    pub fn new(store: CacheStore) -> Self {
        Self::builder(store).assemble()
    }

    pub fn builder(store: CacheStore) -> QueryClientBuilder {
        QueryClientBuilder {
            store,
            tracker: TrackerConfig::default(),
            defaults: QueryOptions::default(),
            events: EventSources::none(),
            hooks: Vec::new(),
        }
    }

    /// Open the configured store and build a client around it.
    pub fn from_config(config: &RevalidConfig) -> RevalidResult<Self> {
        config.validate()?;
        let store = CacheStore::open(&config.cache)?;
        Self::builder(store)
            .tracker_config(config.tracker.clone())
            .default_options(config.query.clone())
            .build()
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn registry(&self) -> &ObserverRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn tracker(&self) -> &InvalidationTracker {
        &self.inner.tracker
    }

    pub fn default_options(&self) -> &QueryOptions {
        &self.inner.defaults
    }

    pub fn add_hook(&self, hook: impl InvalidationHook + 'static) {
        let mut hooks = self.inner.hooks.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.push(Arc::new(hook));
    }

    fn hooks(&self) -> Vec<Arc<dyn InvalidationHook>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Create an observer for `key` with the client's default options. It is
    /// registered for invalidation fan-out once started.
    pub fn query<T: QueryData>(
        &self,
        key: impl Into<String>,
        fetcher: impl Fetcher<T> + 'static,
    ) -> RevalidResult<QueryObserver<T>> {
        self.query_with_options(key, fetcher, self.inner.defaults.clone())
    }

    pub fn query_with_options<T: QueryData>(
        &self,
        key: impl Into<String>,
        fetcher: impl Fetcher<T> + 'static,
        options: QueryOptions,
    ) -> RevalidResult<QueryObserver<T>> {
        QueryObserver::build(
            self.inner.store.clone(),
            key.into(),
            Arc::new(fetcher),
            options,
            self.inner.events.clone(),
            Some(self.downgrade()),
        )
    }

    /// One-shot read. A fresh hit is returned as is; a stale hit is returned
    /// and refreshed in the background; anything else is fetched and stored.
    pub async fn fetch<T: QueryData>(&self, key: &str, fetcher: impl Fetcher<T> + 'static) -> RevalidResult<T> {
        self.fetch_with_options(key, fetcher, self.inner.defaults.clone()).await
    }

    pub async fn fetch_with_options<T: QueryData>(
        &self,
        key: &str,
        fetcher: impl Fetcher<T> + 'static,
        options: QueryOptions,
    ) -> RevalidResult<T> {
        options.validate()?;
        match self.inner.store.get::<T>(key).await {
            Ok(Some(cached)) => {
                if cached.is_stale() {
                    debug!(key, "Serving stale value, refreshing in background");
                    self.spawn_refresh(key.to_string(), Arc::new(fetcher), options);
                }
                return Ok(cached.into_value());
            }
            Ok(None) => debug!(key, "Cache miss"),
            Err(e) if e.is_decode() => debug!(key, error = %e, "Cached payload undecodable, refetching"),
            Err(e) if e.is_storage() => warn!(key, error = %e, "Cache read failed, fetching"),
            Err(e) => return Err(e),
        }
        self.fetch_and_store(key, &fetcher, &options).await
    }

    /// Fetch and store `key` only when it is missing or stale.
    pub async fn prefetch<T: QueryData>(&self, key: &str, fetcher: impl Fetcher<T> + 'static) -> RevalidResult<()> {
        self.prefetch_with_options(key, fetcher, self.inner.defaults.clone()).await
    }

    pub async fn prefetch_with_options<T: QueryData>(
        &self,
        key: &str,
        fetcher: impl Fetcher<T> + 'static,
        options: QueryOptions,
    ) -> RevalidResult<()> {
        options.validate()?;
        let needed = match self.inner.store.get::<T>(key).await {
            Ok(Some(cached)) => cached.is_stale(),
            Ok(None) => true,
            Err(e) if e.is_decode() || e.is_storage() => true,
            Err(e) => return Err(e),
        };
        if needed {
            self.fetch_and_store(key, &fetcher, &options).await?;
        } else {
            debug!(key, "Prefetch skipped, value is fresh");
        }
        Ok(())
    }

    async fn fetch_and_store<T: QueryData>(
        &self,
        key: &str,
        fetcher: &dyn Fetcher<T>,
        options: &QueryOptions,
    ) -> RevalidResult<T> {
        let policy = options.effective_retry_policy();
        let value = fetch_with_retry(key, fetcher, policy.as_ref(), |_, _| {}).await?;
        self.inner.store.set(key, &value, &SetOptions::from(options)).await?;
        Ok(value)
    }

    /// At most one background refresh runs per key; stale hits that arrive
    /// while one is in flight are served without starting another.
    fn spawn_refresh<T: QueryData>(&self, key: String, fetcher: Arc<dyn Fetcher<T>>, options: QueryOptions) {
        let Some(slot) = RefreshSlot::claim(&self.inner, &key) else {
            trace!(key = %key, "Background refresh already in flight");
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = client.fetch_and_store(&key, fetcher.as_ref(), &options).await {
                warn!(key = %key, error = %e, "Background refresh failed");
            }
        });
    }

    /// Invalidate `target` in the store, refresh the affected observers and
    /// run hooks, all inside the tracker.
    ///
    /// A call made outside any invalidation starts a new chain; calls made
    /// from hooks join the chain of the invalidation that ran them.
    pub async fn invalidate(
        &self,
        target: InvalidationTarget,
        source: Option<&str>,
    ) -> RevalidResult<InvalidationOutcome> {
        if let Ok(chain) = INVALIDATION_CHAIN.try_with(Arc::clone) {
            return self.invalidate_in(&chain, &target, source).await;
        }
        let chain = Arc::new(self.inner.tracker.fork());
        INVALIDATION_CHAIN
            .scope(Arc::clone(&chain), async {
                self.invalidate_in(&chain, &target, source).await
            })
            .await
    }

    pub async fn invalidate_tag(&self, tag: &Tag) -> RevalidResult<InvalidationOutcome> {
        self.invalidate(InvalidationTarget::Tag(tag.clone()), None).await
    }

    pub async fn invalidate_key(&self, key: &str) -> RevalidResult<InvalidationOutcome> {
        self.invalidate(InvalidationTarget::Key(key.to_string()), None).await
    }

    async fn invalidate_in(
        &self,
        chain: &InvalidationTracker,
        target: &InvalidationTarget,
        source: Option<&str>,
    ) -> RevalidResult<InvalidationOutcome> {
        let identifier = target.identifier();
        let applied = chain
            .with_invalidation(&identifier, source, move || async move {
                let result = match target {
                    InvalidationTarget::Tag(tag) => self.inner.store.invalidate_tag(tag).await?,
                    InvalidationTarget::Key(key) => self.inner.store.invalidate_key(key).await?,
                };
                let refetched = self.fan_out(&result);
                debug!(
                    target = %target,
                    keys = result.keys.len(),
                    refetched,
                    depth = chain.depth(),
                    "Invalidated"
                );
                for hook in self.hooks() {
                    hook.after_invalidation(self, target, &result.keys).await?;
                }
                Ok(InvalidationOutcome::Applied {
                    keys: result.keys,
                    watermark: result.watermark,
                    refetched,
                })
            })
            .await?;
        Ok(applied.unwrap_or(InvalidationOutcome::Skipped))
    }

    /// Tell each live observer of an affected key, once.
    fn fan_out(&self, result: &InvalidationResult) -> usize {
        if result.is_empty() {
            return 0;
        }
        self.inner
            .registry
            .live_for_keys(&result.keys)
            .into_iter()
            .filter(|observer| observer.on_invalidated(result.watermark))
            .count()
    }

    pub async fn set_query_data<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> RevalidResult<()> {
        self.set_query_data_with(key, data, &SetOptions::from(&self.inner.defaults)).await
    }

    pub async fn set_query_data_with<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        options: &SetOptions,
    ) -> RevalidResult<()> {
        self.inner.store.set(key, data, options).await?;
        Ok(())
    }

    pub async fn get_query_data<T: QueryData>(&self, key: &str) -> RevalidResult<Option<T>> {
        let cached = self.inner.store.get::<T>(key).await?;
        Ok(cached.map(|c| c.into_value()))
    }

    pub async fn remove_query_data(&self, key: &str) -> RevalidResult<bool> {
        self.inner.store.remove(key).await
    }

    pub async fn clear(&self) -> RevalidResult<u64> {
        self.inner.store.clear().await
    }

    /// Delete expired entries and forget observers that are gone.
    pub async fn collect_garbage(&self) -> RevalidResult<GarbageReport> {
        let removed_entries = self.inner.store.collect_garbage().await?;
        let pruned_registrations = self.inner.registry.prune();
        Ok(GarbageReport {
            removed_entries,
            pruned_registrations,
        })
    }

    pub async fn stats(&self) -> RevalidResult<ClientStats> {
        Ok(ClientStats {
            store: self.inner.store.stats().await?,
            tracker: self.inner.tracker.stats(),
            live_observers: self.inner.registry.live_count(),
        })
    }

    /// Run [`QueryClient::collect_garbage`] every `period` until the handle
    /// is shut down or dropped. The task does not keep the client alive.
    pub fn spawn_garbage_collector(&self, period: Duration) -> GarbageCollectorHandle {
        gc::spawn(self.downgrade(), period)
    }
}
