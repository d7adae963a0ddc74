//! Fetch functions and the retry loop around them.

use std::future::Future;

use async_trait::async_trait;
use revalid_core::{FetchError, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Values a query can fetch and cache.
pub trait QueryData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> QueryData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// An asynchronous source of fresh values for one key.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> Result<T, FetchError>;
}

/// A [`Fetcher`] backed by a closure returning a future.
#[derive(Clone)]
pub struct FnFetcher<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFetcher").finish_non_exhaustive()
    }
}

/// Wrap `f` as a [`Fetcher`].
///
/// ```ignore
/// let fetcher = fetcher_fn(|| async { api.load_user(1).await.map_err(|e| FetchError::from_error(&e)) });
/// ```
pub fn fetcher_fn<F>(f: F) -> FnFetcher<F> {
    FnFetcher { f }
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    async fn fetch(&self) -> Result<T, FetchError> {
        (self.f)().await
    }
}

/// Run `fetcher` until it succeeds or `policy` runs out of attempts.
///
/// `on_failure` sees every failed attempt number (starting at 1). Delays use
/// `tokio::time`, so paused-clock tests advance through them instantly.
pub(crate) async fn fetch_with_retry<T>(
    key: &str,
    fetcher: &dyn Fetcher<T>,
    policy: &dyn RetryPolicy,
    mut on_failure: impl FnMut(u32, &FetchError) + Send,
) -> Result<T, FetchError> {
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                on_failure(attempt, &e);
                if attempt >= max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_after(attempt);
                debug!(key, attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %e, "Fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
