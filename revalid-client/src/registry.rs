//! Non-owning registry of live observers, indexed by cache key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use revalid_storage::Watermark;
use tracing::trace;

/// What the client needs from an observer to fan out invalidations.
pub(crate) trait RegisteredObserver: Send + Sync {
    fn observer_id(&self) -> u64;

    /// React to an invalidation recorded at `watermark`. Returns whether a
    /// fetch was started or joined.
    fn on_invalidated(&self, watermark: Watermark) -> bool;
}

struct Registration {
    id: u64,
    observer: Weak<dyn RegisteredObserver>,
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    by_key: Mutex<HashMap<String, Vec<Registration>>>,
}

impl ObserverRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Registration>>> {
        // Registrations stay consistent even if a holder panicked.
        self.by_key.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `observer` under `key`. Re-registering the same id replaces it.
    pub(crate) fn register(&self, key: &str, id: u64, observer: Weak<dyn RegisteredObserver>) {
        let mut by_key = self.lock();
        let registrations = by_key.entry(key.to_string()).or_default();
        registrations.retain(|r| r.id != id);
        registrations.push(Registration { id, observer });
        trace!(key, observer_id = id, "Registered observer");
    }

    pub(crate) fn unregister(&self, key: &str, id: u64) {
        let mut by_key = self.lock();
        if let Some(registrations) = by_key.get_mut(key) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                by_key.remove(key);
            }
        }
    }

    /// Live observers registered under any of `keys`, each at most once.
    pub(crate) fn live_for_keys(&self, keys: &[String]) -> Vec<Arc<dyn RegisteredObserver>> {
        let by_key = self.lock();
        let mut seen = HashSet::new();
        let mut live = Vec::new();
        for key in keys {
            let Some(registrations) = by_key.get(key) else {
                continue;
            };
            for registration in registrations {
                if !seen.insert(registration.id) {
                    continue;
                }
                if let Some(observer) = registration.observer.upgrade() {
                    live.push(observer);
                }
            }
        }
        live
    }

    /// Drop registrations whose observer is gone. Returns how many.
    pub(crate) fn prune(&self) -> usize {
        let mut by_key = self.lock();
        let mut pruned = 0;
        by_key.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.observer.strong_count() > 0);
            pruned += before - registrations.len();
            !registrations.is_empty()
        });
        pruned
    }

    pub(crate) fn live_count(&self) -> usize {
        let by_key = self.lock();
        by_key
            .values()
            .flatten()
            .filter(|r| r.observer.strong_count() > 0)
            .map(|r| r.id)
            .collect::<HashSet<_>>()
            .len()
    }
}
