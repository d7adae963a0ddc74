//! Error types for revalid operations

use std::time::Duration;
use thiserror::Error;

/// Persistent tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend operation {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

impl StorageError {
    /// Wrap a backend-native error with the name of the failing operation.
    pub fn backend(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }
}

/// A cached payload could not be decoded into the requested type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cached payload for {key} could not be decoded as {type_name}: {reason}")]
pub struct DecodeError {
    pub key: String,
    pub type_name: String,
    pub reason: String,
}

/// Failure reported by an external fetch function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Fetch failed: {message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Capture any error's message as a fetch failure.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::new(err.to_string())
    }
}

/// Invalidation tracker guard violations (strict mode only).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Invalidation cycle detected at {trigger} (depth {depth}): {chain:?}")]
    CycleDetected {
        trigger: String,
        chain: Vec<String>,
        depth: usize,
    },

    #[error("Invalidation depth exceeded at {trigger}: depth {depth} > max {max_depth}")]
    DepthExceeded {
        trigger: String,
        depth: usize,
        max_depth: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Validation errors for values handed to the cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid tag: {reason}")]
    InvalidTag { reason: String },

    #[error("Stale time {stale_time:?} exceeds cache time {cache_time:?}")]
    InvalidLifetime {
        stale_time: Duration,
        cache_time: Duration,
    },
}

/// Master error type for all revalid errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevalidError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl RevalidError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for revalid operations.
pub type RevalidResult<T> = Result<T, RevalidError>;
