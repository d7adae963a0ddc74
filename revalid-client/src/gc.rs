//! Periodic garbage collection
//!
//! A background task that calls [`QueryClient::collect_garbage`] on a fixed
//! interval: expired entries are deleted from both tiers and registrations
//! of dropped observers are pruned.
//!
//! ```ignore
//! let gc = client.spawn_garbage_collector(Duration::from_secs(300));
//! // ...
//! let totals = gc.shutdown().await;
//! println!("removed {} entries", totals.entries_removed);
//! ```
//!
//! The task holds only a weak reference to the client and ends on its own
//! once the client is gone or the handle is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::client::{ClientInner, QueryClient};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the garbage collector.
#[derive(Debug, Default)]
pub struct GarbageCollectorMetrics {
    /// Sweeps completed, failed ones included
    pub sweeps: AtomicU64,

    /// Expired entries deleted
    pub entries_removed: AtomicU64,

    /// Dead observer registrations pruned
    pub registrations_pruned: AtomicU64,

    /// Sweeps that failed
    pub errors: AtomicU64,
}

impl GarbageCollectorMetrics {
    pub fn snapshot(&self) -> GarbageCollectorSnapshot {
        GarbageCollectorSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            registrations_pruned: self.registrations_pruned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Garbage collector counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageCollectorSnapshot {
    pub sweeps: u64,
    pub entries_removed: u64,
    pub registrations_pruned: u64,
    pub errors: u64,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Controls a running garbage collector. Dropping it stops the task.
#[derive(Debug)]
pub struct GarbageCollectorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    metrics: Arc<GarbageCollectorMetrics>,
}

impl GarbageCollectorHandle {
    pub fn metrics(&self) -> GarbageCollectorSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for the sweep in progress, if any.
    pub async fn shutdown(self) -> GarbageCollectorSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Garbage collector task failed");
        }
        self.metrics.snapshot()
    }
}

pub(crate) fn spawn(client: Weak<ClientInner>, period: Duration) -> GarbageCollectorHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(GarbageCollectorMetrics::default());
    let task = tokio::spawn(garbage_collector_task(
        client,
        period,
        Arc::clone(&metrics),
        shutdown_rx,
    ));
    GarbageCollectorHandle {
        shutdown_tx,
        task,
        metrics,
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

async fn garbage_collector_task(
    client: Weak<ClientInner>,
    period: Duration,
    metrics: Arc<GarbageCollectorMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = period.as_millis() as u64, "Cache garbage collector started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped handle counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache garbage collector shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(inner) = client.upgrade() else {
                    tracing::debug!("Client dropped, stopping garbage collector");
                    break;
                };
                sweep(&QueryClient::from_inner(inner), &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        entries_removed = snapshot.entries_removed,
        registrations_pruned = snapshot.registrations_pruned,
        errors = snapshot.errors,
        "Cache garbage collector completed"
    );
}

async fn sweep(client: &QueryClient, metrics: &GarbageCollectorMetrics) {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    match client.collect_garbage().await {
        Ok(report) => {
            metrics
                .entries_removed
                .fetch_add(report.removed_entries, Ordering::Relaxed);
            metrics
                .registrations_pruned
                .fetch_add(report.pruned_registrations as u64, Ordering::Relaxed);
            if report.removed_entries > 0 {
                tracing::info!(
                    removed_entries = report.removed_entries,
                    pruned_registrations = report.pruned_registrations,
                    "Garbage collection sweep removed entries"
                );
            } else {
                tracing::trace!("Garbage collection sweep found nothing to remove");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Garbage collection sweep failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = GarbageCollectorMetrics::default();
        metrics.sweeps.fetch_add(2, Ordering::Relaxed);
        metrics.entries_removed.fetch_add(5, Ordering::Relaxed);
        assert_eq!(
            metrics.snapshot(),
            GarbageCollectorSnapshot {
                sweeps: 2,
                entries_removed: 5,
                registrations_pruned: 0,
                errors: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_task_stops_when_client_is_gone() {
        let handle = spawn(Weak::new(), Duration::from_millis(5));
        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("task stops");
        assert_eq!(snapshot.sweeps, 0);
    }
}
