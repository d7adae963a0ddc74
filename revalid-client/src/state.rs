//! Observer state.

use chrono::{DateTime, Utc};
use revalid_core::RevalidError;

/// Where an observer's data stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    /// No data yet and a fetch is underway.
    Pending,
    Success,
    /// No data and the last fetch failed.
    Error,
}

/// Whether a fetch is running right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    /// Waiting for connectivity before fetching.
    Paused,
}

/// Snapshot of one observer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Last good value.
    pub data: Option<T>,
    /// Terminal error; only set while there is no data.
    pub error: Option<RevalidError>,
    /// Failure of a refresh that happened while data was present.
    pub background_error: Option<RevalidError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Failed attempts since the last success.
    pub failure_count: u32,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            background_error: None,
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            failure_count: 0,
            data_updated_at: None,
            is_stale: false,
        }
    }
}

impl<T> QueryState<T> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }
}
