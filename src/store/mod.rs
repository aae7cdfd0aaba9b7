//! Storage backend abstraction.
//!
//! `spec.md` §1 models the backing store as "a transactional KV+range
//! abstraction; any implementation that honors its contract (SQLite,
//! Postgres, FoundationDB-style) is acceptable." The [`Storage`] trait is
//! that contract: it speaks only in terms of the four persisted tables
//! from §6.1 (events, snapshots, projections, command_log), with no
//! knowledge of aggregates, projections-as-objects or commands-as-objects
//! layered on top - those live in [`crate::event_store`],
//! [`crate::projection`] and [`crate::command`] respectively.
//!
//! Two implementations ship: [`sqlite::SqliteStorage`], the durable
//! reference backend, and [`memory::InMemoryStorage`], a lock-based
//! backend for tests and hosts that want no filesystem dependency at all.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// A single persisted event row, as read back from storage.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub position: i64,
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub caused_by: Option<String>,
    pub metadata: Option<Value>,
}

/// A single persisted snapshot row.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

/// A projection's persisted cursor + state.
#[derive(Debug, Clone)]
pub struct ProjectionRow {
    pub name: String,
    pub state: Value,
    pub position: i64,
}

/// A command-dispatch audit row.
#[derive(Debug, Clone)]
pub struct CommandRow {
    pub id: String,
    pub command_type: String,
    pub payload: Value,
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub status: String,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

/// A new event queued for append, before a position has been assigned.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub caused_by: Option<String>,
    pub metadata: Option<Value>,
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I1 violated at the storage layer.
    #[error("version conflict for aggregate {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    /// A value could not be (de)serialized to/from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other backend I/O failure (connection loss, disk error, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The storage contract every backend must honor (`spec.md` §6.1).
///
/// All methods that mutate the `events` table must be atomic: either every
/// row in the batch is committed with contiguous positions, or none is.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append events for a single aggregate. Implementations MUST read
    /// the aggregate's current version within the same transaction and
    /// verify that `events[0].version == current_version + 1` and that
    /// each subsequent event's version is contiguous, failing atomically
    /// with `VersionConflict` otherwise (I1). Returns the assigned
    /// positions in submission order.
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<i64>, StorageError>;

    /// Events for one aggregate with `version > from_version`, ascending.
    async fn load_events(
        &self,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRow>, StorageError>;

    /// Events of one aggregate type with `position > after_position`,
    /// ascending by position.
    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        after_position: i64,
    ) -> Result<Vec<EventRow>, StorageError>;

    /// The full global stream after `after_position`, ascending.
    async fn load_all_events(&self, after_position: i64) -> Result<Vec<EventRow>, StorageError>;

    /// The highest position assigned so far, or 0 if the store is empty.
    async fn max_position(&self) -> Result<i64, StorageError>;

    /// The current version of an aggregate (highest `version` among its
    /// events), or 0 if it has none.
    async fn current_version(&self, aggregate_id: &str) -> Result<i64, StorageError>;

    /// The `aggregate_type` recorded against an aggregate's events, if
    /// any exist.
    async fn aggregate_type_of(&self, aggregate_id: &str) -> Result<Option<String>, StorageError>;

    /// Persist a snapshot row.
    async fn save_snapshot(&self, snapshot: SnapshotRow) -> Result<(), StorageError>;

    /// The snapshot with the highest version for an aggregate, if any.
    async fn load_latest_snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError>;

    /// Fetch a projection's persisted cursor/state, if it has been
    /// registered before.
    async fn load_projection(&self, name: &str) -> Result<Option<ProjectionRow>, StorageError>;

    /// Persist a projection's state and cursor position atomically.
    async fn save_projection(&self, row: ProjectionRow) -> Result<(), StorageError>;

    /// Insert a new `pending` command-audit row.
    async fn insert_command(&self, row: CommandRow) -> Result<(), StorageError>;

    /// Update a command-audit row's outcome.
    async fn update_command(
        &self,
        id: &str,
        status: &str,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StorageError>;

    /// Fetch a command-audit row by id (used by tests and `statistics`).
    async fn load_command(&self, id: &str) -> Result<Option<CommandRow>, StorageError>;
}
