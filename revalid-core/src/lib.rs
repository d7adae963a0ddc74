//! revalid core - tags, errors, configuration and invalidation tracking
//!
//! Pure types with no I/O. Every other revalid crate depends on this one.

pub mod clock;
pub mod config;
pub mod error;
pub mod retry;
pub mod tag;
pub mod tracker;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub use clock::{add_duration, Clock, ManualClock, SystemClock};
pub use config::{CacheOptions, QueryOptions, RevalidConfig, StorageLocation};
pub use error::{
    ConfigError, DecodeError, FetchError, RevalidError, RevalidResult, StorageError,
    TrackerError, ValidationError,
};
pub use retry::{ExponentialBackoff, FixedDelay, RetryPolicy};
pub use tag::{Tag, TagSet};
pub use tracker::{
    key_identifier, tag_identifier, CycleReport, InvalidationChainEntry, InvalidationToken,
    InvalidationTracker, TrackerConfig, TrackerStats,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Hex-encoded SHA-256 of a serialized payload.
///
/// Only used to tell whether two payloads differ; never to verify storage.
pub fn compute_payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_is_stable_and_content_sensitive() {
        let a = compute_payload_hash(br#"{"id":1}"#);
        let b = compute_payload_hash(br#"{"id":1}"#);
        let c = compute_payload_hash(br#"{"id":2}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
