//! Watermarks and change notifications.
//!
//! Every mutation of the store advances a watermark and publishes a
//! [`ChangeEvent`] carrying it, so subscribers can tell whether a change
//! happened after some point they already observed.

use chrono::{DateTime, Utc};

/// A point in the store's mutation history.
///
/// Sequences are strictly increasing per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    pub sequence: u64,
    /// When the mutation was recorded.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn with_timestamp(sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// The watermark before any mutation.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    pub fn is_at_least(&self, other: &Watermark) -> bool {
        self.sequence >= other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Which keys a mutation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    Keys(Vec<String>),
    /// Every key may have changed (clear, lagged subscribers).
    All,
}

impl ChangeScope {
    pub fn affects(&self, key: &str) -> bool {
        match self {
            Self::Keys(keys) => keys.iter().any(|k| k == key),
            Self::All => true,
        }
    }
}

/// Published after every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub scope: ChangeScope,
    pub watermark: Watermark,
}
