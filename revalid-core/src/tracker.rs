//! Cycle and depth guard for recursive invalidation.
//!
//! The tracker keeps the chain of invalidations that are currently in
//! progress. Entering an identifier that is already on the chain is a cycle;
//! growing the chain past `max_depth` trips the depth guard. In permissive
//! mode both conditions degrade to a skipped invalidation (a no-op token);
//! in strict mode they are errors.
//!
//! The tracker knows nothing about caches. Identifiers are opaque strings,
//! conventionally `tag:<tag>` or `key:<key>`.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RevalidResult, TrackerError};
use crate::tag::Tag;

/// Called whenever a cycle is observed, before the strict/permissive decision.
pub type CycleCallback = Arc<dyn Fn(&CycleReport) + Send + Sync>;

/// Identifier used on the chain for a tag invalidation.
pub fn tag_identifier(tag: &Tag) -> String {
    format!("tag:{tag}")
}

/// Identifier used on the chain for a key invalidation.
pub fn key_identifier(key: &str) -> String {
    format!("key:{key}")
}

/// Tracker policy.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_depth: usize,
    pub throw_on_cycle: bool,
    pub log_warnings: bool,
    #[serde(skip)]
    pub on_cycle_detected: Option<CycleCallback>,
}

impl TrackerConfig {
    /// Low depth limit, violations are errors.
    pub fn strict() -> Self {
        Self {
            max_depth: 5,
            throw_on_cycle: true,
            log_warnings: true,
            on_cycle_detected: None,
        }
    }

    /// Higher depth limit, violations are logged and skipped.
    pub fn permissive() -> Self {
        Self {
            max_depth: 10,
            throw_on_cycle: false,
            log_warnings: true,
            on_cycle_detected: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_log_warnings(mut self, enabled: bool) -> Self {
        self.log_warnings = enabled;
        self
    }

    pub fn with_cycle_callback(mut self, callback: impl Fn(&CycleReport) + Send + Sync + 'static) -> Self {
        self.on_cycle_detected = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracker.max_depth".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one invalidation".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::permissive()
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("max_depth", &self.max_depth)
            .field("throw_on_cycle", &self.throw_on_cycle)
            .field("log_warnings", &self.log_warnings)
            .field("on_cycle_detected", &self.on_cycle_detected.is_some())
            .finish()
    }
}

/// One in-flight invalidation on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationChainEntry {
    pub identifier: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What a cycle callback gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: String,
    pub chain: Vec<InvalidationChainEntry>,
    pub depth: usize,
}

/// Cumulative counters, shared by every chain forked from one tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub total_invalidations: u64,
    pub cycles_detected: u64,
    pub max_depth_reached: usize,
    pub depth_exceeded_count: u64,
}

/// Proof of a `begin_invalidation` call, handed back to `end_invalidation`.
///
/// A token for a skipped invalidation is a no-op: nothing was pushed, so
/// ending it does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an active token must be passed to end_invalidation"]
pub struct InvalidationToken {
    slot: Option<u64>,
    identifier: String,
}

impl InvalidationToken {
    /// False when the invalidation was skipped by the cycle or depth guard.
    pub fn is_active(&self) -> bool {
        self.slot.is_some()
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

#[derive(Debug, Default)]
struct ChainState {
    entries: Vec<(u64, InvalidationChainEntry)>,
    active: HashSet<String>,
    next_slot: u64,
}

/// Chain tracker. See the module docs.
#[derive(Debug)]
pub struct InvalidationTracker {
    config: Arc<TrackerConfig>,
    stats: Arc<Mutex<TrackerStats>>,
    chain: Mutex<ChainState>,
}

impl InvalidationTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(Mutex::new(TrackerStats::default())),
            chain: Mutex::new(ChainState::default()),
        }
    }

    /// A tracker with an empty chain that shares this tracker's config and
    /// stats. Unrelated invalidation call trees each get their own fork.
    pub fn fork(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            chain: Mutex::new(ChainState::default()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stats(&self) -> TrackerStats {
        *lock(&self.stats)
    }

    pub fn reset_stats(&self) {
        *lock(&self.stats) = TrackerStats::default();
    }

    /// Current chain length.
    pub fn depth(&self) -> usize {
        lock(&self.chain).entries.len()
    }

    /// Snapshot of the chain, outermost first.
    pub fn chain(&self) -> Vec<InvalidationChainEntry> {
        lock(&self.chain)
            .entries
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn is_active(&self, identifier: &str) -> bool {
        lock(&self.chain).active.contains(identifier)
    }

    /// Enter an invalidation.
    ///
    /// Returns an inactive token when the invalidation must be skipped
    /// (permissive mode) and an error in strict mode.
    pub fn begin_invalidation(
        &self,
        identifier: &str,
        source: Option<&str>,
    ) -> Result<InvalidationToken, TrackerError> {
        let mut chain = lock(&self.chain);
        let mut stats = lock(&self.stats);
        stats.total_invalidations += 1;

        if chain.active.contains(identifier) {
            stats.cycles_detected += 1;
            let report = CycleReport {
                trigger: identifier.to_string(),
                chain: chain.entries.iter().map(|(_, e)| e.clone()).collect(),
                depth: chain.entries.len(),
            };
            drop(stats);
            drop(chain);
            return self.on_cycle(report);
        }

        if chain.entries.len() >= self.config.max_depth {
            stats.depth_exceeded_count += 1;
            let depth = chain.entries.len() + 1;
            drop(stats);
            drop(chain);
            if self.config.log_warnings {
                tracing::warn!(
                    trigger = identifier,
                    depth,
                    max_depth = self.config.max_depth,
                    "Invalidation depth exceeded"
                );
            }
            if self.config.throw_on_cycle {
                return Err(TrackerError::DepthExceeded {
                    trigger: identifier.to_string(),
                    depth,
                    max_depth: self.config.max_depth,
                });
            }
            return Ok(Self::skipped(identifier));
        }

        let slot = chain.next_slot;
        chain.next_slot += 1;
        chain.entries.push((
            slot,
            InvalidationChainEntry {
                identifier: identifier.to_string(),
                source: source.map(str::to_string),
                timestamp: Utc::now(),
            },
        ));
        chain.active.insert(identifier.to_string());
        stats.max_depth_reached = stats.max_depth_reached.max(chain.entries.len());

        Ok(InvalidationToken {
            slot: Some(slot),
            identifier: identifier.to_string(),
        })
    }

    /// Leave an invalidation. Only the token for the top of the chain pops
    /// it; anything else is ignored.
    pub fn end_invalidation(&self, token: InvalidationToken) {
        let Some(slot) = token.slot else {
            return;
        };
        let mut chain = lock(&self.chain);
        match chain.entries.last() {
            Some((top, _)) if *top == slot => {
                if let Some((_, entry)) = chain.entries.pop() {
                    chain.active.remove(&entry.identifier);
                }
            }
            _ => {
                tracing::debug!(
                    identifier = %token.identifier,
                    "Ignoring end of invalidation that is not on top of the chain"
                );
            }
        }
    }

    /// Run `body` inside an invalidation scope.
    ///
    /// Returns `Ok(None)` when the invalidation was skipped. The scope is
    /// closed on every exit path, including errors and the future being
    /// dropped.
    pub async fn with_invalidation<F, Fut, T>(
        &self,
        identifier: &str,
        source: Option<&str>,
        body: F,
    ) -> RevalidResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RevalidResult<T>>,
    {
        let token = self.begin_invalidation(identifier, source)?;
        if !token.is_active() {
            return Ok(None);
        }
        let _scope = ScopeGuard {
            tracker: self,
            token: Some(token),
        };
        body().await.map(Some)
    }

    fn on_cycle(&self, report: CycleReport) -> Result<InvalidationToken, TrackerError> {
        if let Some(callback) = &self.config.on_cycle_detected {
            callback(&report);
        }
        let mut chain: Vec<String> = report.chain.iter().map(|e| e.identifier.clone()).collect();
        chain.push(report.trigger.clone());
        if self.config.log_warnings {
            tracing::warn!(
                trigger = %report.trigger,
                depth = report.depth,
                chain = ?chain,
                "Invalidation cycle detected"
            );
        }
        if self.config.throw_on_cycle {
            return Err(TrackerError::CycleDetected {
                trigger: report.trigger,
                chain,
                depth: report.depth,
            });
        }
        Ok(Self::skipped(&report.trigger))
    }

    fn skipped(identifier: &str) -> InvalidationToken {
        InvalidationToken {
            slot: None,
            identifier: identifier.to_string(),
        }
    }
}

impl Default for InvalidationTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

struct ScopeGuard<'a> {
    tracker: &'a InvalidationTracker,
    token: Option<InvalidationToken>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.tracker.end_invalidation(token);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded state stays consistent across a panic in a caller, so a
    // poisoned lock is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RevalidError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn strict(max_depth: usize) -> InvalidationTracker {
        InvalidationTracker::new(TrackerConfig::strict().with_max_depth(max_depth))
    }

    fn permissive(max_depth: usize) -> InvalidationTracker {
        InvalidationTracker::new(
            TrackerConfig::permissive()
                .with_max_depth(max_depth)
                .with_log_warnings(false),
        )
    }

    #[test]
    fn test_begin_and_end_balance() {
        let tracker = permissive(10);
        let a = tracker.begin_invalidation("tag:a", Some("test")).expect("begin a");
        let b = tracker.begin_invalidation("tag:b", None).expect("begin b");
        assert!(a.is_active() && b.is_active());
        assert_eq!(tracker.depth(), 2);
        assert_eq!(tracker.chain()[0].source.as_deref(), Some("test"));

        tracker.end_invalidation(b);
        tracker.end_invalidation(a);
        assert_eq!(tracker.depth(), 0);
        assert!(!tracker.is_active("tag:a"));

        let stats = tracker.stats();
        assert_eq!(stats.total_invalidations, 2);
        assert_eq!(stats.max_depth_reached, 2);
    }

    #[test]
    fn test_mismatched_token_is_ignored() {
        let tracker = permissive(10);
        let a = tracker.begin_invalidation("tag:a", None).expect("begin a");
        let b = tracker.begin_invalidation("tag:b", None).expect("begin b");

        tracker.end_invalidation(a.clone());
        assert_eq!(tracker.depth(), 2);
        assert!(tracker.is_active("tag:a"));

        tracker.end_invalidation(b);
        tracker.end_invalidation(a);
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_direct_cycle_permissive_skips() {
        let tracker = permissive(10);
        let a = tracker.begin_invalidation("tag:A", None).expect("begin");
        let again = tracker.begin_invalidation("tag:A", None).expect("permissive");
        assert!(!again.is_active());
        assert_eq!(tracker.stats().cycles_detected, 1);

        // Ending the skipped token must not pop the real entry.
        tracker.end_invalidation(again);
        assert_eq!(tracker.depth(), 1);
        tracker.end_invalidation(a);
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_direct_cycle_strict_reports_depth_one() {
        let tracker = strict(5);
        let _a = tracker.begin_invalidation("tag:A", None).expect("begin");
        let err = tracker
            .begin_invalidation("tag:A", None)
            .expect_err("cycle should error");
        match err {
            TrackerError::CycleDetected {
                trigger,
                chain,
                depth,
            } => {
                assert_eq!(trigger, "tag:A");
                assert_eq!(depth, 1);
                assert_eq!(chain, vec!["tag:A".to_string(), "tag:A".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(tracker.stats().cycles_detected, 1);
    }

    #[test]
    fn test_indirect_cycle_detected_at_depth_three() {
        let tracker = strict(5);
        let _a = tracker.begin_invalidation("tag:A", None).expect("A");
        let _b = tracker.begin_invalidation("tag:B", None).expect("B");
        let _c = tracker.begin_invalidation("tag:C", None).expect("C");
        let err = tracker.begin_invalidation("tag:A", None).expect_err("cycle");
        assert!(matches!(err, TrackerError::CycleDetected { depth: 3, .. }));
    }

    #[test]
    fn test_depth_guard() {
        let tracker = strict(3);
        let _tokens: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| tracker.begin_invalidation(id, None).expect("within depth"))
            .collect();
        let err = tracker.begin_invalidation("d", None).expect_err("too deep");
        assert_eq!(
            err,
            TrackerError::DepthExceeded {
                trigger: "d".to_string(),
                depth: 4,
                max_depth: 3,
            }
        );
        assert_eq!(tracker.stats().depth_exceeded_count, 1);

        let lenient = permissive(3);
        let _held: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| lenient.begin_invalidation(id, None).expect("within depth"))
            .collect();
        let skipped = lenient.begin_invalidation("d", None).expect("permissive");
        assert!(!skipped.is_active());
        assert_eq!(lenient.depth(), 3);
        assert_eq!(lenient.stats().depth_exceeded_count, 1);
    }

    #[test]
    fn test_cycle_callback_invoked() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let tracker = InvalidationTracker::new(
            TrackerConfig::permissive()
                .with_log_warnings(false)
                .with_cycle_callback(move |report| {
                    assert_eq!(report.trigger, "key:x");
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let _x = tracker.begin_invalidation("key:x", None).expect("begin");
        let _ = tracker.begin_invalidation("key:x", None).expect("skip");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fork_shares_stats_not_chain() {
        let tracker = permissive(10);
        let fork = tracker.fork();
        let _a = tracker.begin_invalidation("tag:A", None).expect("begin");
        let in_fork = fork.begin_invalidation("tag:A", None).expect("begin");
        assert!(in_fork.is_active());
        assert_eq!(tracker.stats().total_invalidations, 2);
        assert_eq!(fork.stats().cycles_detected, 0);
    }

    #[tokio::test]
    async fn test_with_invalidation_closes_scope_on_error() {
        let tracker = permissive(10);
        let result: RevalidResult<Option<()>> = tracker
            .with_invalidation("tag:A", None, || async {
                Err(RevalidError::Cancelled)
            })
            .await;
        assert!(matches!(result, Err(RevalidError::Cancelled)));
        assert_eq!(tracker.depth(), 0);
    }

    #[tokio::test]
    async fn test_with_invalidation_skips_cycle() {
        let tracker = permissive(10);
        let outer = tracker
            .with_invalidation("tag:A", None, || async {
                let inner = tracker
                    .with_invalidation("tag:A", None, || async { Ok(1) })
                    .await?;
                assert_eq!(inner, None);
                Ok(2)
            })
            .await
            .expect("outer runs");
        assert_eq!(outer, Some(2));
        assert_eq!(tracker.stats().cycles_detected, 1);
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        assert!(TrackerConfig::strict().with_max_depth(0).validate().is_err());
        assert!(!TrackerConfig::default().throw_on_cycle);
    }
}
