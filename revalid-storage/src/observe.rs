//! Live per-key change streams.
//!
//! An [`EntryStream`] first yields the entry as it is at subscription time
//! (or `None`), then yields again whenever a change notification touches the
//! key and the re-read entry differs in payload hash or invalidation flag.
//! Each emission carries the watermark of the change that produced it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use revalid_core::RevalidResult;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::entry::{CacheEntry, EntryFingerprint};
use crate::store::CacheStore;
use crate::watermark::{ChangeEvent, Watermark};

const STREAM_BUFFER: usize = 16;

/// One emission of an [`EntryStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub entry: RevalidResult<Option<CacheEntry>>,
    /// The change that caused the re-read; the store's watermark at
    /// subscription for the first emission.
    pub watermark: Watermark,
}

/// Stream of an entry's distinct states. Dropping it stops the watch.
#[derive(Debug)]
pub struct EntryStream {
    key: String,
    rx: mpsc::Receiver<Observation>,
    task: JoinHandle<()>,
}

impl EntryStream {
    pub(crate) fn spawn(store: CacheStore, key: String) -> Self {
        // Subscribe before the first read so no change can fall between them.
        let changes = store.subscribe_changes();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(watch_entry(store, key.clone(), tx, changes));
        Self { key, rx, task }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next distinct state, or `None` once the stream is cancelled.
    pub async fn next_entry(&mut self) -> Option<RevalidResult<Option<CacheEntry>>> {
        self.rx.recv().await.map(|observation| observation.entry)
    }

    /// Like [`EntryStream::next_entry`], with the causing watermark.
    pub async fn next_observation(&mut self) -> Option<Observation> {
        self.rx.recv().await
    }

    /// Stop watching. Buffered states are discarded.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Stream for EntryStream {
    type Item = RevalidResult<Option<CacheEntry>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|observation| observation.map(|o| o.entry))
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_entry(
    store: CacheStore,
    key: String,
    tx: mpsc::Sender<Observation>,
    mut changes: broadcast::Receiver<ChangeEvent>,
) {
    // `None` until the first emission; then the last emitted fingerprint.
    let mut last: Option<Option<EntryFingerprint>> = None;
    let mut pending: Option<Watermark> = Some(store.current_watermark());

    loop {
        if let Some(watermark) = pending.take() {
            let result = store.get_entry(&key).await;
            if tx.is_closed() {
                break;
            }
            match result {
                Ok(entry) => {
                    let fingerprint = entry.as_ref().map(CacheEntry::fingerprint);
                    if last.as_ref() == Some(&fingerprint) {
                        trace!(key = %key, "Suppressed unchanged emission");
                    } else {
                        last = Some(fingerprint);
                        let observation = Observation {
                            entry: Ok(entry),
                            watermark,
                        };
                        if tx.send(observation).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Observed read failed");
                    let observation = Observation {
                        entry: Err(e),
                        watermark,
                    };
                    if tx.send(observation).await.is_err() {
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = tx.closed() => break,
            event = changes.recv() => match event {
                Ok(event) => {
                    if event.scope.affects(&key) {
                        pending = Some(event.watermark);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(key = %key, skipped, "Change stream lagged, re-reading");
                    pending = Some(store.current_watermark());
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    trace!(key = %key, "Entry watch stopped");
}
