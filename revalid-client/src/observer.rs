//! Per-key query observers.
//!
//! A [`QueryObserver`] turns a cache key plus a [`Fetcher`] into a reactive
//! [`QueryState`]. While started it follows the store's change stream for
//! its key (when `stale_time > 0`), refreshes on the edge into staleness,
//! and reacts to focus, reconnect and coordinator invalidations.
//!
//! At most one fetch runs per observer. Foreground callers join it,
//! background triggers are dropped while it runs, and a forced refetch
//! cancels it. Every trigger that carries a watermark is ignored unless the
//! change it describes happened after the current fetch started.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use revalid_core::{FetchError, QueryOptions, RevalidError, RevalidResult};
use revalid_storage::{CacheEntry, CacheStore, EntryStream, Observation, SetOptions, Watermark};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace, warn};

use crate::client::{ClientInner, InvalidationOutcome, InvalidationTarget, QueryClient};
use crate::events::{ConnectivityStatus, EventSources};
use crate::fetcher::{fetch_with_retry, Fetcher, QueryData};
use crate::registry::RegisteredObserver;
use crate::state::{FetchStatus, QueryState, QueryStatus};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type SharedFetch = Shared<BoxFuture<'static, RevalidResult<()>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Join a running fetch or start a foreground one.
    Join,
    /// Cancel any running fetch and start a foreground one.
    Force,
    /// Refresh behind existing data. Dropped while another fetch runs, and
    /// when `trigger` is not newer than the running or last fetch.
    Background { trigger: Option<Watermark> },
}

struct InFlight {
    id: u64,
    cancel: watch::Sender<bool>,
    shared: SharedFetch,
    // Keeps the fetch running when nobody awaits it.
    driver: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    started: bool,
    stream_active: bool,
    tasks: Vec<JoinHandle<()>>,
    stale_timer: Option<JoinHandle<()>>,
    in_flight: Option<InFlight>,
    /// Store watermark when the latest fetch started.
    fetched_at: Watermark,
    next_fetch_id: u64,
}

struct ObserverCore<T: QueryData> {
    id: u64,
    key: String,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher<T>>,
    options: QueryOptions,
    set_options: SetOptions,
    events: EventSources,
    state: watch::Sender<QueryState<T>>,
    control: Mutex<Control>,
}

impl<T: QueryData> ObserverCore<T> {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_started(&self) -> bool {
        self.lock_control().started
    }

    fn has_data(&self) -> bool {
        self.state.borrow().data.is_some()
    }

    fn start(self: &Arc<Self>) {
        let mut control = self.lock_control();
        if control.started {
            return;
        }
        control.started = true;

        if self.options.stale_time.is_zero() {
            let core = Arc::clone(self);
            control.tasks.push(tokio::spawn(async move { core.initial_read().await }));
        } else {
            // The stream's first emission doubles as the initial read.
            let stream = self.store.observe(self.key.clone());
            control.stream_active = true;
            let core = Arc::clone(self);
            control
                .tasks
                .push(tokio::spawn(async move { core.consume_stream(stream).await }));
        }

        if self.options.refetch_on_focus {
            if let Some(focus) = self.events.subscribe_focus() {
                let core = Arc::clone(self);
                control.tasks.push(tokio::spawn(core.listen_focus(focus)));
            }
        }
        if self.options.refetch_on_reconnect {
            if let Some(connectivity) = self.events.connectivity() {
                let core = Arc::clone(self);
                control
                    .tasks
                    .push(tokio::spawn(core.listen_connectivity(connectivity)));
            }
        }

        debug!(key = %self.key, observer_id = self.id, streaming = control.stream_active, "Observer started");
    }

    fn stop(&self) {
        let (tasks, timer, in_flight) = {
            let mut control = self.lock_control();
            if !control.started && control.in_flight.is_none() {
                return;
            }
            control.started = false;
            control.stream_active = false;
            (
                std::mem::take(&mut control.tasks),
                control.stale_timer.take(),
                control.in_flight.take(),
            )
        };

        for task in tasks {
            task.abort();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(in_flight) = in_flight {
            let _ = in_flight.cancel.send(true);
            in_flight.driver.abort();
            debug!(key = %self.key, fetch_id = in_flight.id, "Cancelled in-flight fetch");
        }

        self.state.send_modify(|state| {
            state.fetch_status = FetchStatus::Idle;
            if state.status == QueryStatus::Pending {
                state.status = QueryStatus::Idle;
            }
        });
        debug!(key = %self.key, observer_id = self.id, "Observer stopped");
    }

    async fn initial_read(self: Arc<Self>) {
        match self.store.get_entry(&self.key).await {
            Ok(Some(entry)) => match entry.decode::<T>() {
                Ok(value) => {
                    let stale = entry.is_stale(self.store.now());
                    self.apply_entry(value, &entry, stale);
                }
                Err(e) => {
                    debug!(key = %self.key, error = %e, "Cached payload undecodable, refetching");
                    self.start_fetch(FetchMode::Force);
                }
            },
            Ok(None) => {
                trace!(key = %self.key, "Cache miss");
                self.start_fetch(FetchMode::Join);
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Cache read failed, fetching");
                self.start_fetch(FetchMode::Join);
            }
        }
    }

    async fn consume_stream(self: Arc<Self>, mut stream: EntryStream) {
        let mut first = true;
        let mut was_stale = false;
        while let Some(observation) = stream.next_observation().await {
            self.handle_observation(observation, first, &mut was_stale);
            first = false;
        }
        trace!(key = %self.key, "Observer stream ended");
    }

    fn handle_observation(self: &Arc<Self>, observation: Observation, first: bool, was_stale: &mut bool) {
        let entry = match observation.entry {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if first {
                    trace!(key = %self.key, "Cache miss");
                    self.start_fetch(FetchMode::Join);
                } else {
                    // Removed from the store; keep the last good value.
                    self.state.send_if_modified(|state| {
                        let changed = state.data.is_some() && !state.is_stale;
                        state.is_stale |= state.data.is_some();
                        changed
                    });
                    *was_stale = true;
                }
                return;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Observed read failed");
                if first {
                    self.start_fetch(FetchMode::Join);
                }
                return;
            }
        };

        let value = match entry.decode::<T>() {
            Ok(value) => value,
            Err(e) => {
                debug!(key = %self.key, error = %e, "Cached payload undecodable, forcing refetch");
                self.start_fetch(FetchMode::Force);
                return;
            }
        };

        let now = self.store.now();
        let stale = entry.is_stale(now);
        self.apply_entry(value, &entry, stale);

        if stale {
            if first {
                self.start_fetch(FetchMode::Background { trigger: None });
            } else if !*was_stale {
                self.start_fetch(FetchMode::Background {
                    trigger: Some(observation.watermark),
                });
            }
        } else {
            self.arm_stale_timer(&entry, now);
        }
        *was_stale = stale;
    }

    fn apply_entry(&self, value: T, entry: &CacheEntry, stale: bool) {
        self.state.send_if_modified(|state| {
            // A direct commit may already hold something newer.
            if state.data_updated_at.is_some_and(|at| at > entry.updated_at) {
                return false;
            }
            state.data = Some(value);
            state.data_updated_at = Some(entry.updated_at);
            state.is_stale = stale;
            state.status = QueryStatus::Success;
            state.error = None;
            true
        });
    }

    fn arm_stale_timer(self: &Arc<Self>, entry: &CacheEntry, now: chrono::DateTime<chrono::Utc>) {
        let mut control = self.lock_control();
        if let Some(previous) = control.stale_timer.take() {
            previous.abort();
        }
        let Some(stale_at) = entry.stale_at else {
            return;
        };
        if !control.started {
            return;
        }
        let wait = (stale_at - now).to_std().unwrap_or(Duration::ZERO);
        let core = Arc::clone(self);
        control.stale_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            core.on_stale_timer();
        }));
    }

    fn on_stale_timer(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }
        trace!(key = %self.key, "Value went stale");
        self.state.send_modify(|state| state.is_stale = true);
        self.start_fetch(FetchMode::Background { trigger: None });
    }

    async fn listen_focus(self: Arc<Self>, mut focus: broadcast::Receiver<()>) {
        loop {
            match focus.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => self.refresh_on_event("focus"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn listen_connectivity(self: Arc<Self>, mut connectivity: watch::Receiver<ConnectivityStatus>) {
        // The initial value is not a transition.
        let mut previous = *connectivity.borrow_and_update();
        while connectivity.changed().await.is_ok() {
            let current = *connectivity.borrow_and_update();
            if !previous.is_satisfied() && current.is_satisfied() {
                self.refresh_on_event("reconnect");
            }
            previous = current;
        }
    }

    fn refresh_on_event(self: &Arc<Self>, reason: &'static str) {
        if !self.is_started() {
            return;
        }
        let mode = if self.has_data() {
            FetchMode::Background { trigger: None }
        } else {
            FetchMode::Join
        };
        debug!(key = %self.key, reason, "Refreshing on lifecycle event");
        self.start_fetch(mode);
    }

    fn on_invalidated(self: &Arc<Self>, watermark: Watermark) -> bool {
        if !self.is_started() {
            return false;
        }
        let mode = if self.has_data() {
            FetchMode::Background {
                trigger: Some(watermark),
            }
        } else {
            FetchMode::Join
        };
        self.start_fetch(mode).is_some()
    }

    /// Start, join or skip a fetch. Returns the fetch the caller may await.
    fn start_fetch(self: &Arc<Self>, mode: FetchMode) -> Option<SharedFetch> {
        let mut control = self.lock_control();

        if let Some(in_flight) = &control.in_flight {
            match mode {
                FetchMode::Join => return Some(in_flight.shared.clone()),
                FetchMode::Background { .. } => {
                    trace!(key = %self.key, fetch_id = in_flight.id, "Fetch in flight, dropping trigger");
                    return None;
                }
                FetchMode::Force => {
                    let _ = in_flight.cancel.send(true);
                    debug!(key = %self.key, fetch_id = in_flight.id, "Superseding in-flight fetch");
                }
            }
        }

        if let FetchMode::Background {
            trigger: Some(watermark),
        } = mode
        {
            if !watermark.is_newer_than(&control.fetched_at) {
                trace!(
                    key = %self.key,
                    trigger = watermark.sequence,
                    fetched_at = control.fetched_at.sequence,
                    "Change already covered by a fetch"
                );
                return None;
            }
        }

        control.next_fetch_id += 1;
        let id = control.next_fetch_id;
        control.fetched_at = self.store.current_watermark();

        let background = matches!(mode, FetchMode::Background { .. });
        let (cancel, cancelled) = watch::channel(false);
        let core = Arc::clone(self);
        let shared = async move { core.run_fetch(id, background, cancelled).await }
            .boxed()
            .shared();
        let driver = tokio::spawn(shared.clone().map(|_| ()));
        control.in_flight = Some(InFlight {
            id,
            cancel,
            shared: shared.clone(),
            driver,
        });
        trace!(key = %self.key, fetch_id = id, ?mode, "Fetch started");
        Some(shared)
    }

    async fn run_fetch(self: Arc<Self>, id: u64, background: bool, mut cancelled: watch::Receiver<bool>) -> RevalidResult<()> {
        self.state.send_modify(|state| {
            state.fetch_status = FetchStatus::Fetching;
            if !background && state.data.is_none() {
                state.status = QueryStatus::Pending;
            }
        });

        let fetched = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancelled) => Err(RevalidError::Cancelled),
            result = self.fetch_value() => result,
        };

        let outcome = match fetched {
            Ok(_) if is_cancelled(&cancelled) => Err(RevalidError::Cancelled),
            Ok(value) => self.commit(value).await,
            Err(e) => Err(e),
        };

        self.finish(id, background, &outcome);
        outcome
    }

    async fn fetch_value(&self) -> RevalidResult<T> {
        self.wait_for_connectivity().await;
        let policy = self.options.effective_retry_policy();
        let on_failure = |_attempt: u32, _error: &FetchError| {
            self.state.send_modify(|state| state.failure_count += 1);
        };
        let value = fetch_with_retry(&self.key, self.fetcher.as_ref(), policy.as_ref(), on_failure).await?;
        Ok(value)
    }

    async fn wait_for_connectivity(&self) {
        let Some(mut connectivity) = self.events.connectivity() else {
            return;
        };
        if connectivity.borrow().is_satisfied() {
            return;
        }
        self.state.send_modify(|state| state.fetch_status = FetchStatus::Paused);
        debug!(key = %self.key, "Fetch paused until connectivity returns");
        let _ = connectivity.wait_for(ConnectivityStatus::is_satisfied).await;
        self.state.send_modify(|state| state.fetch_status = FetchStatus::Fetching);
    }

    async fn commit(&self, value: T) -> RevalidResult<()> {
        let written = self.store.set(&self.key, &value, &self.set_options).await;
        let stream_active = self.lock_control().stream_active;

        self.state.send_modify(|state| {
            let updated_at = written.as_ref().ok().map(|entry| entry.updated_at);
            if !stream_active || state.data.is_none() || written.is_err() {
                state.data = Some(value);
                state.data_updated_at = updated_at.or_else(|| Some(self.store.now()));
            } else if let Some(updated_at) = updated_at {
                // The stream delivers the value; it may suppress an emission
                // whose hash matches what is already shown.
                if state.data_updated_at.map_or(true, |at| at <= updated_at) {
                    state.data_updated_at = Some(updated_at);
                }
            }
            state.status = QueryStatus::Success;
            state.is_stale = false;
            state.error = None;
            state.failure_count = 0;
            if written.is_ok() {
                state.background_error = None;
            }
        });

        written.map(|_| ())
    }

    fn finish(&self, id: u64, background: bool, outcome: &RevalidResult<()>) {
        let current = {
            let mut control = self.lock_control();
            if control.in_flight.as_ref().is_some_and(|f| f.id == id) {
                control.in_flight = None;
                true
            } else {
                false
            }
        };

        match outcome {
            Ok(()) => {
                if current {
                    self.state.send_modify(|state| state.fetch_status = FetchStatus::Idle);
                }
                trace!(key = %self.key, fetch_id = id, "Fetch finished");
            }
            Err(RevalidError::Cancelled) => {
                if current {
                    self.state.send_modify(|state| {
                        state.fetch_status = FetchStatus::Idle;
                        if state.status == QueryStatus::Pending {
                            state.status = QueryStatus::Idle;
                        }
                    });
                }
                debug!(key = %self.key, fetch_id = id, "Fetch cancelled");
            }
            Err(e) => {
                self.state.send_modify(|state| {
                    if current {
                        state.fetch_status = FetchStatus::Idle;
                    }
                    if background || state.data.is_some() {
                        state.background_error = Some(e.clone());
                        if state.status == QueryStatus::Pending {
                            state.status = QueryStatus::Success;
                        }
                    } else {
                        state.error = Some(e.clone());
                        state.status = QueryStatus::Error;
                    }
                });
                warn!(key = %self.key, fetch_id = id, background, error = %e, "Fetch failed");
            }
        }
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    // A dropped sender means the fetch was superseded or stopped.
    let _ = cancelled.wait_for(|flag| *flag).await;
}

fn is_cancelled(cancelled: &watch::Receiver<bool>) -> bool {
    *cancelled.borrow() || cancelled.has_changed().is_err()
}

/// Owner of a running core. Dropping the last one stops the observer.
struct ObserverHandle<T: QueryData> {
    core: Arc<ObserverCore<T>>,
    client: Option<Weak<ClientInner>>,
}

impl<T: QueryData> ObserverHandle<T> {
    fn client(&self) -> Option<QueryClient> {
        self.client
            .as_ref()
            .and_then(Weak::upgrade)
            .map(QueryClient::from_inner)
    }
}

impl<T: QueryData> RegisteredObserver for ObserverHandle<T> {
    fn observer_id(&self) -> u64 {
        self.core.id
    }

    fn on_invalidated(&self, watermark: Watermark) -> bool {
        self.core.on_invalidated(watermark)
    }
}

impl<T: QueryData> Drop for ObserverHandle<T> {
    fn drop(&mut self) {
        self.core.stop();
        if let Some(client) = self.client.as_ref().and_then(Weak::upgrade) {
            client.registry().unregister(&self.core.key, self.core.id);
        }
    }
}

/// Reactive view of one cache key.
///
/// Cloning shares the observer. The observer stops when the last clone is
/// dropped.
pub struct QueryObserver<T: QueryData> {
    handle: Arc<ObserverHandle<T>>,
}

impl<T: QueryData> Clone for QueryObserver<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: QueryData> fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.handle.core.id)
            .field("key", &self.handle.core.key)
            .field("observing", &self.is_observing())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData> QueryObserver<T> {
    /// An observer with no coordinator and no lifecycle events.
    pub fn new(
        store: CacheStore,
        key: impl Into<String>,
        fetcher: impl Fetcher<T> + 'static,
        options: QueryOptions,
    ) -> RevalidResult<Self> {
        Self::build(store, key.into(), Arc::new(fetcher), options, EventSources::none(), None)
    }

    /// An observer with no coordinator that listens to `events`.
    pub fn with_events(
        store: CacheStore,
        key: impl Into<String>,
        fetcher: impl Fetcher<T> + 'static,
        options: QueryOptions,
        events: EventSources,
    ) -> RevalidResult<Self> {
        Self::build(store, key.into(), Arc::new(fetcher), options, events, None)
    }

    pub(crate) fn build(
        store: CacheStore,
        key: String,
        fetcher: Arc<dyn Fetcher<T>>,
        options: QueryOptions,
        events: EventSources,
        client: Option<Weak<ClientInner>>,
    ) -> RevalidResult<Self> {
        options.validate()?;
        let core = Arc::new(ObserverCore {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            key,
            store,
            fetcher,
            set_options: SetOptions::from(&options),
            options,
            events,
            state: watch::Sender::new(QueryState::default()),
            control: Mutex::new(Control::default()),
        });
        Ok(Self {
            handle: Arc::new(ObserverHandle { core, client }),
        })
    }

    pub fn id(&self) -> u64 {
        self.handle.core.id
    }

    pub fn key(&self) -> &str {
        &self.handle.core.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.handle.core.options
    }

    pub fn is_observing(&self) -> bool {
        self.handle.core.is_started()
    }

    /// Read the cache and begin reacting to changes. Idempotent.
    pub fn start_observing(&self) {
        if let Some(client) = self.handle.client() {
            let weak: Weak<ObserverHandle<T>> = Arc::downgrade(&self.handle);
            client.registry().register(self.key(), self.id(), weak);
        }
        self.handle.core.start();
    }

    /// Cancel the stream, any in-flight fetch and every event listener.
    /// Data already shown is kept.
    pub fn stop_observing(&self) {
        if let Some(client) = self.handle.client() {
            client.registry().unregister(self.key(), self.id());
        }
        self.handle.core.stop();
    }

    /// Cancel any running fetch and fetch again.
    pub async fn refetch(&self) -> RevalidResult<()> {
        match self.handle.core.start_fetch(FetchMode::Force) {
            Some(fetch) => fetch.await,
            None => Ok(()),
        }
    }

    /// Fetch unless a fetch is already running, in which case join it.
    pub async fn fetch(&self) -> RevalidResult<()> {
        match self.handle.core.start_fetch(FetchMode::Join) {
            Some(fetch) => fetch.await,
            None => Ok(()),
        }
    }

    /// Mark the key stale and refetch.
    ///
    /// Goes through the coordinator when one is attached so the invalidation
    /// is guarded against cycles; otherwise marks the store directly.
    pub async fn invalidate(&self) -> RevalidResult<()> {
        let core = &self.handle.core;
        match self.handle.client() {
            Some(client) => {
                let target = InvalidationTarget::Key(core.key.clone());
                let outcome = client.invalidate(target, Some("observer")).await?;
                let reached = match &outcome {
                    InvalidationOutcome::Applied { keys, .. } => {
                        self.is_observing() && keys.iter().any(|k| k == &core.key)
                    }
                    InvalidationOutcome::Skipped => return Ok(()),
                };
                if reached {
                    return Ok(());
                }
            }
            None => {
                core.store.invalidate_key(&core.key).await?;
            }
        }
        self.fetch().await
    }

    pub fn state(&self) -> QueryState<T> {
        self.handle.core.state.borrow().clone()
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.handle.core.state.subscribe()
    }

    /// The current state followed by every change.
    pub fn state_stream(&self) -> WatchStream<QueryState<T>> {
        WatchStream::new(self.subscribe())
    }

    pub fn data(&self) -> Option<T> {
        self.handle.core.state.borrow().data.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.handle.core.state.borrow().status
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.handle.core.state.borrow().fetch_status
    }
}
