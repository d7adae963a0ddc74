//! revalid storage - the dual-tier cache store
//!
//! A [`CacheStore`] keeps entries in a durable [`PersistentBackend`]
//! (SQLite by default) fronted by an optional in-process
//! [`FastPathMirror`]. Mutations are serialized, stamped with a
//! [`Watermark`] and broadcast so [`EntryStream`]s can follow single keys.

pub mod backend;
pub mod entry;
pub mod migrations;
pub mod mirror;
pub mod observe;
pub mod sqlite;
pub mod store;
pub mod watermark;

pub use backend::{BackendStats, PersistentBackend};
pub use entry::{CacheEntry, CachedValue, EntryFingerprint, SetOptions};
pub use migrations::{latest_version, Migration, MIGRATIONS};
pub use mirror::{FastPathMirror, MirrorLookup};
pub use observe::{EntryStream, Observation};
pub use sqlite::SqliteBackend;
pub use store::{CacheStore, InvalidationResult, StoreStats};
pub use watermark::{ChangeEvent, ChangeScope, Watermark};
