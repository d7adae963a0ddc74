//! Configuration types

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{FixedDelay, RetryPolicy};
use crate::tag::{Tag, TagSet};
use crate::tracker::TrackerConfig;

/// Durations are written as integer milliseconds in configuration files.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-query options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// How long a fetched value counts as fresh.
    #[serde(rename = "stale_time_ms", with = "duration_ms")]
    pub stale_time: Duration,
    /// How long a value may be served at all.
    #[serde(rename = "cache_time_ms", with = "duration_ms")]
    pub cache_time: Duration,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    /// Total fetch attempts, including the first.
    pub retry_count: u32,
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Tags attached to every value this query writes.
    pub tags: TagSet,
    /// Overrides the fixed-delay policy built from `retry_count`/`retry_delay`.
    #[serde(skip)]
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(300),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            tags: TagSet::new(),
            retry_policy: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        for tag in tags {
            self.tags.insert(tag);
        }
        self
    }

    /// The policy fetches actually use.
    pub fn effective_retry_policy(&self) -> Arc<dyn RetryPolicy> {
        match &self.retry_policy {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(FixedDelay::new(self.retry_count, self.retry_delay)),
        }
    }

    /// Stale time may not exceed cache time: a value would expire before it
    /// could ever be served stale.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_time > self.cache_time {
            return Err(ConfigError::InvalidValue {
                field: "stale_time".to_string(),
                value: format!("{:?}", self.stale_time),
                reason: format!("must not exceed cache_time ({:?})", self.cache_time),
            });
        }
        if self.retry_count == 0 && self.retry_policy.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "retry_count".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

/// Where the persistent tier lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StorageLocation {
    #[default]
    InMemory,
    File(PathBuf),
}

/// Per-cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub location: StorageLocation,
    /// Enable write-ahead logging on file-backed stores.
    pub wal: bool,
    /// Upper bound on the database file size.
    pub max_size_bytes: Option<u64>,
    /// Keep an in-process mirror in front of the persistent tier.
    pub mirror_enabled: bool,
    pub mirror_capacity: usize,
    /// Buffered change notifications per subscriber before it lags.
    pub change_channel_capacity: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            location: StorageLocation::InMemory,
            wal: true,
            max_size_bytes: None,
            mirror_enabled: true,
            mirror_capacity: 1_000,
            change_channel_capacity: 256,
        }
    }
}

impl CacheOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StorageLocation::File(path.into()),
            ..Self::default()
        }
    }

    pub fn with_wal(mut self, enabled: bool) -> Self {
        self.wal = enabled;
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = Some(bytes);
        self
    }

    pub fn with_mirror(mut self, enabled: bool) -> Self {
        self.mirror_enabled = enabled;
        self
    }

    pub fn with_mirror_capacity(mut self, capacity: usize) -> Self {
        self.mirror_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirror_enabled && self.mirror_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive when the mirror is enabled".to_string(),
            });
        }
        if self.change_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "change_channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if let Some(0) = self.max_size_bytes {
            return Err(ConfigError::InvalidValue {
                field: "max_size_bytes".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything a client needs, loadable from one TOML document.
///
/// ```toml
/// [cache]
/// location = { kind = "file", path = "/var/cache/app/query.db" }
/// mirror_capacity = 500
///
/// [query]
/// stale_time_ms = 30000
/// cache_time_ms = 600000
///
/// [tracker]
/// max_depth = 8
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RevalidConfig {
    pub cache: CacheOptions,
    pub query: QueryOptions,
    pub tracker: TrackerConfig,
}

impl RevalidConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.query.validate()?;
        self.tracker.validate()
    }
}
