//! revalid client - query observers and the invalidation coordinator
//!
//! A [`QueryClient`] wraps a [`revalid_storage::CacheStore`]. It serves
//! one-shot fetches, creates [`QueryObserver`]s that keep a [`QueryState`]
//! current, and fans tag or key invalidations out to the store and to every
//! started observer, guarded by an invalidation tracker.
//!
//! ```ignore
//! let client = QueryClient::new(CacheStore::open(&CacheOptions::file("cache.db"))?);
//! let users = client.query("users", fetcher_fn(|| async { api.users().await }))?;
//! users.start_observing();
//! client.invalidate_tag(&Tag::parse("users")?).await?;
//! ```

pub mod client;
pub mod events;
pub mod fetcher;
pub mod gc;
pub mod observer;
mod registry;
pub mod state;

pub use client::{
    ClientStats, GarbageReport, InvalidationHook, InvalidationOutcome, InvalidationTarget,
    QueryClient, QueryClientBuilder,
};
pub use events::{ConnectivityStatus, EventSources, LifecycleEvents};
pub use fetcher::{fetcher_fn, FnFetcher, Fetcher, QueryData};
pub use gc::{GarbageCollectorHandle, GarbageCollectorMetrics, GarbageCollectorSnapshot};
pub use observer::QueryObserver;
pub use state::{FetchStatus, QueryState, QueryStatus};
