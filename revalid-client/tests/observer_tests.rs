//! Query observer behaviour: cache reads, fetch lifecycle, cancellation and
//! lifecycle events.

use std::time::Duration;

use revalid_client::{
    ConnectivityStatus, FetchStatus, LifecycleEvents, QueryClient, QueryObserver, QueryStatus,
};
use revalid_core::{QueryOptions, RevalidError};
use revalid_storage::SetOptions;
use revalid_test_utils::fixtures::{failing_store, init_tracing, memory_store, wait_for_state};
use revalid_test_utils::ScriptedFetcher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u32,
    name: String,
}

fn profile(name: &str) -> Profile {
    Profile {
        id: 1,
        name: name.to_string(),
    }
}

fn streaming() -> QueryOptions {
    QueryOptions::new()
        .with_stale_time(Duration::from_secs(60))
        .with_cache_time(Duration::from_secs(600))
}

fn long_lived() -> SetOptions {
    SetOptions::new()
        .with_stale_time(Duration::from_secs(60))
        .with_cache_time(Duration::from_secs(600))
}

#[tokio::test]
async fn corrupted_row_is_refetched_once() {
    init_tracing();
    let store = memory_store();
    store
        .set_raw("profile", b"{not json".to_vec(), "Profile", &long_lived())
        .await
        .expect("seed corrupted row");

    let fetcher = ScriptedFetcher::always(profile("fresh"));
    let observer = QueryObserver::new(store.clone(), "profile", fetcher.clone(), streaming()).expect("observer");
    observer.start_observing();

    let state = wait_for_state(&observer, |s| s.has_data() && !s.is_fetching()).await;
    assert_eq!(state.data, Some(profile("fresh")));
    assert!(state.error.is_none());
    assert!(state.background_error.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 1);
    let stored = store
        .get::<Profile>("profile")
        .await
        .expect("row decodes now")
        .expect("present");
    assert_eq!(stored.into_value(), profile("fresh"));
}

#[tokio::test]
async fn corrupted_row_without_stream_is_refetched() {
    let store = memory_store();
    store
        .set_raw("profile", b"not json".to_vec(), "Profile", &long_lived())
        .await
        .expect("seed corrupted row");

    let fetcher = ScriptedFetcher::always(profile("fresh"));
    let observer =
        QueryObserver::new(store, "profile", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();

    let state = wait_for_state(&observer, |s| s.is_success() && !s.is_fetching()).await;
    assert_eq!(state.data, Some(profile("fresh")));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn stopping_mid_fetch_keeps_data_and_writes_nothing() {
    let store = memory_store();
    store.set("k", &1u32, &long_lived()).await.expect("seed");

    let fetcher = ScriptedFetcher::gated();
    fetcher.set_fallback(Ok(2u32));
    let observer = QueryObserver::new(store.clone(), "k", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    let refetch = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.refetch().await })
    };
    fetcher.wait_for_calls(1).await;
    let before = store.current_watermark();

    observer.stop_observing();
    let result = refetch.await.expect("refetch task");
    assert_eq!(result, Err(RevalidError::Cancelled));

    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = observer.state();
    assert_eq!(state.data, Some(1));
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert!(state.error.is_none());
    assert!(state.background_error.is_none());
    assert_eq!(store.current_watermark(), before);
    assert_eq!(
        store.get::<u32>("k").await.expect("get").expect("present").into_value(),
        1
    );
}

#[tokio::test]
async fn stopping_a_pending_fetch_returns_to_idle() {
    let store = memory_store();
    let fetcher = ScriptedFetcher::<u32>::gated();
    let observer = QueryObserver::new(store, "k", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.is_pending()).await;

    observer.stop_observing();
    let state = observer.state();
    assert_eq!(state.status, QueryStatus::Idle);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert!(state.error.is_none());
    assert!(!observer.is_observing());
}

#[tokio::test(start_paused = true)]
async fn first_failure_is_terminal_after_retries() {
    let store = memory_store();
    let fetcher = ScriptedFetcher::<u32>::new();
    fetcher.set_fallback(Err(revalid_core::FetchError::new("offline")));
    let options = QueryOptions::new().with_retry(3, Duration::from_secs(1));
    let observer = QueryObserver::new(store, "k", fetcher.clone(), options).expect("observer");

    let started = tokio::time::Instant::now();
    observer.start_observing();
    let state = wait_for_state(&observer, |s| s.is_error()).await;

    assert_eq!(fetcher.calls(), 3);
    assert_eq!(state.failure_count, 3);
    assert!(state.data.is_none());
    assert!(matches!(state.error, Some(RevalidError::Fetch(_))));
    assert!(state.background_error.is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn failure_with_data_is_a_background_error() {
    let store = memory_store();
    store.set("k", &7u32, &long_lived()).await.expect("seed");
    let fetcher = ScriptedFetcher::<u32>::new();
    fetcher.set_fallback(Err(revalid_core::FetchError::new("boom")));
    let options = QueryOptions::new().with_retry(2, Duration::from_millis(100));
    let observer = QueryObserver::new(store, "k", fetcher.clone(), options).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(7)).await;

    let result = observer.refetch().await;
    assert!(matches!(result, Err(RevalidError::Fetch(_))));

    let state = observer.state();
    assert_eq!(state.data, Some(7));
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_none());
    assert!(matches!(state.background_error, Some(RevalidError::Fetch(_))));
    assert_eq!(state.failure_count, 2);
}

#[tokio::test]
async fn success_resets_failure_count() {
    let store = memory_store();
    let fetcher = ScriptedFetcher::new();
    fetcher.push_err("flaky").push_ok(5u32);
    let options = QueryOptions::new().with_retry(2, Duration::ZERO);
    let observer = QueryObserver::new(store, "k", fetcher.clone(), options).expect("observer");
    observer.start_observing();

    let state = wait_for_state(&observer, |s| s.is_success()).await;
    assert_eq!(state.data, Some(5));
    assert_eq!(state.failure_count, 0);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn foreground_callers_join_the_running_fetch() {
    let store = memory_store();
    let fetcher = ScriptedFetcher::gated();
    fetcher.set_fallback(Ok(3u32));
    let observer = QueryObserver::new(store, "k", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();
    fetcher.wait_for_calls(1).await;

    let joined = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.fetch().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    fetcher.release(1);

    assert_eq!(joined.await.expect("join task"), Ok(()));
    assert_eq!(observer.data(), Some(3));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn storage_read_failure_falls_back_to_fetch() {
    let (store, backend) = failing_store();
    backend.set_fail_reads(true);
    let fetcher = ScriptedFetcher::always(4u32);
    let observer = QueryObserver::new(store, "k", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();

    let state = wait_for_state(&observer, |s| s.is_success()).await;
    assert_eq!(state.data, Some(4));
    assert!(state.error.is_none());
}

#[tokio::test]
async fn storage_write_failure_keeps_fetched_value() {
    let (store, backend) = failing_store();
    backend.set_fail_writes(true);
    let fetcher = ScriptedFetcher::always(4u32);
    let observer = QueryObserver::new(store, "k", fetcher, QueryOptions::new()).expect("observer");
    observer.start_observing();

    let state = wait_for_state(&observer, |s| s.background_error.is_some()).await;
    assert_eq!(state.data, Some(4));
    assert_eq!(state.status, QueryStatus::Success);
    assert!(matches!(state.background_error, Some(RevalidError::Storage(_))));
}

#[tokio::test]
async fn stream_delivers_writes_from_elsewhere() {
    let store = memory_store();
    store.set("k", &1u32, &long_lived()).await.expect("seed");
    let fetcher = ScriptedFetcher::<u32>::new();
    let observer = QueryObserver::new(store.clone(), "k", fetcher.clone(), streaming()).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    let client = QueryClient::new(store);
    client.set_query_data_with("k", &2u32, &long_lived()).await.expect("write");

    let state = wait_for_state(&observer, |s| s.data == Some(2)).await;
    assert!(!state.is_stale);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn invalidation_edge_refreshes_once() {
    let store = memory_store();
    store.set("k", &1u32, &long_lived()).await.expect("seed");
    let fetcher = ScriptedFetcher::always(2u32);
    let observer = QueryObserver::new(store.clone(), "k", fetcher.clone(), streaming()).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    store.invalidate_key("k").await.expect("invalidate");
    let state = wait_for_state(&observer, |s| s.data == Some(2) && !s.is_fetching()).await;
    assert!(!state.is_stale);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn observer_invalidate_without_client_marks_store_and_refetches() {
    let store = memory_store();
    store.set("k", &1u32, &long_lived()).await.expect("seed");
    let fetcher = ScriptedFetcher::always(2u32);
    let observer = QueryObserver::new(store, "k", fetcher.clone(), QueryOptions::new()).expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    observer.invalidate().await.expect("invalidate");
    assert_eq!(observer.data(), Some(2));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn focus_refreshes_only_when_enabled() {
    let events = LifecycleEvents::default();
    let store = memory_store();

    let fetcher = ScriptedFetcher::new();
    fetcher.push_ok(1u32);
    fetcher.set_fallback(Ok(2));
    let observer = QueryObserver::with_events(store.clone(), "on", fetcher.clone(), QueryOptions::new(), events.sources())
        .expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    let quiet_fetcher = ScriptedFetcher::always(10u32);
    let quiet = QueryObserver::with_events(
        store,
        "off",
        quiet_fetcher.clone(),
        QueryOptions::new().with_refetch_on_focus(false),
        events.sources(),
    )
    .expect("observer");
    quiet.start_observing();
    wait_for_state(&quiet, |s| s.data == Some(10)).await;

    events.notify_focus();
    wait_for_state(&observer, |s| s.data == Some(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(quiet_fetcher.calls(), 1);

    observer.stop_observing();
    events.notify_focus();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn reconnect_refreshes_on_transition_only() {
    let events = LifecycleEvents::new(ConnectivityStatus::Satisfied);
    let fetcher = ScriptedFetcher::new();
    fetcher.push_ok(1u32);
    fetcher.set_fallback(Ok(2));
    let options = QueryOptions::new().with_refetch_on_focus(false);
    let observer = QueryObserver::with_events(memory_store(), "k", fetcher.clone(), options, events.sources())
        .expect("observer");
    observer.start_observing();
    wait_for_state(&observer, |s| s.data == Some(1)).await;

    events.set_connectivity(ConnectivityStatus::Unsatisfied);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 1);

    events.set_connectivity(ConnectivityStatus::Satisfied);
    wait_for_state(&observer, |s| s.data == Some(2)).await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn fetch_pauses_while_offline() {
    let events = LifecycleEvents::new(ConnectivityStatus::Unsatisfied);
    let fetcher = ScriptedFetcher::always(1u32);
    let options = QueryOptions::new().with_refetch_on_reconnect(false);
    let observer = QueryObserver::with_events(memory_store(), "k", fetcher.clone(), options, events.sources())
        .expect("observer");
    observer.start_observing();

    let paused = wait_for_state(&observer, |s| s.is_paused()).await;
    assert_eq!(paused.status, QueryStatus::Pending);
    assert_eq!(fetcher.calls(), 0);

    events.set_connectivity(ConnectivityStatus::Satisfied);
    let state = wait_for_state(&observer, |s| s.is_success()).await;
    assert_eq!(state.data, Some(1));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn dropping_the_last_handle_stops_the_observer() {
    let store = memory_store();
    let fetcher = ScriptedFetcher::<u32>::gated();
    let observer = QueryObserver::new(store.clone(), "k", fetcher.clone(), streaming()).expect("observer");
    let states = observer.subscribe();
    observer.start_observing();
    fetcher.wait_for_calls(1).await;

    drop(observer);
    fetcher.release(1);
    store.set("k", &9u32, &long_lived()).await.expect("write");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let last = states.borrow().clone();
    assert!(last.data.is_none());
    assert_eq!(last.fetch_status, FetchStatus::Idle);
    assert_eq!(last.status, QueryStatus::Idle);
}
