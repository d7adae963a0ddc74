//! Cache entries and the values read out of them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use revalid_core::{DecodeError, QueryOptions, TagSet, ValidationError};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// One stored record, identical in both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: Uuid,
    pub key: String,
    /// Serialized value.
    pub payload: Vec<u8>,
    /// Digest of `payload`, used only to detect changes.
    pub payload_hash: String,
    /// Name of the type the payload was written as. Diagnostic only.
    pub type_tag: String,
    pub tags: TagSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stale_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// Set by invalidation, cleared by the next successful write.
    pub invalidated: bool,
}

impl CacheEntry {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.invalidated || self.stale_at.is_some_and(|stale_at| stale_at < now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// The part of the entry that change observation compares.
    pub fn fingerprint(&self) -> EntryFingerprint {
        EntryFingerprint {
            payload_hash: self.payload_hash.clone(),
            invalidated: self.invalidated,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|e| DecodeError {
            key: self.key.clone(),
            type_name: std::any::type_name::<T>().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Change-detection identity of an entry.
///
/// Two entries with equal fingerprints are the same emission, whatever their
/// `updated_at` or time-based staleness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryFingerprint {
    pub payload_hash: String,
    pub invalidated: bool,
}

/// Lifetimes and labels for a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub tags: TagSet,
    /// `None` means the value never goes stale by time.
    pub stale_time: Option<Duration>,
    /// `None` means the value never expires.
    pub cache_time: Option<Duration>,
    pub etag: Option<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Reject writes that would expire before they go stale.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.stale_time, self.cache_time) {
            (Some(stale_time), Some(cache_time)) if stale_time > cache_time => {
                Err(ValidationError::InvalidLifetime {
                    stale_time,
                    cache_time,
                })
            }
            _ => Ok(()),
        }
    }
}

impl From<&QueryOptions> for SetOptions {
    fn from(options: &QueryOptions) -> Self {
        Self {
            tags: options.tags.clone(),
            stale_time: Some(options.stale_time),
            cache_time: Some(options.cache_time),
            etag: None,
        }
    }
}

/// A decoded value together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    value: T,
    is_stale: bool,
    updated_at: DateTime<Utc>,
    from_mirror: bool,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, is_stale: bool, updated_at: DateTime<Utc>, from_mirror: bool) -> Self {
        Self {
            value,
            is_stale,
            updated_at,
            from_mirror,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// True when the value was served by the in-process mirror.
    pub fn was_mirror_hit(&self) -> bool {
        self.from_mirror
    }

    pub fn map<U, F>(self, f: F) -> CachedValue<U>
    where
        F: FnOnce(T) -> U,
    {
        CachedValue {
            value: f(self.value),
            is_stale: self.is_stale,
            updated_at: self.updated_at,
            from_mirror: self.from_mirror,
        }
    }
}
