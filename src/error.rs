//! Crate-wide error types.
//!
//! Each component has its own error enum (see `store`, `projection`); this
//! module defines the top-level `EngineError` they funnel into, matching
//! the taxonomy in `spec.md` §7.

use thiserror::Error;

use crate::projection::ProjectionError;
use crate::store::StorageError;

/// Engine-wide `Result` alias.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the event store, aggregate reconstruction and
/// projection manager. The Command Bus is the only component that does
/// *not* propagate its failures through this type (`spec.md` §4.4 step
/// 5), it captures them into a `DispatchOutcome` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I1 violated: the submitted events are not the expected next
    /// version for this aggregate. The caller should reload the
    /// aggregate and retry.
    #[error("version conflict for aggregate {aggregate_id}: expected next version {expected}, submitted {actual}")]
    VersionConflict {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    /// The underlying storage backend could not complete the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A payload or state value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A projection handler failed; the cursor was not advanced past the
    /// failing event.
    #[error("projection handler failed: {0}")]
    ProjectionHandlerFailure(String),

    /// The requested aggregate, snapshot or projection does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `append` was called with an empty or malformed event sequence.
    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                aggregate_id,
                expected,
                actual,
            } => EngineError::VersionConflict {
                aggregate_id,
                expected,
                actual,
            },
            StorageError::Serialization(e) => EngineError::Serialization(e),
            StorageError::NotFound(what) => EngineError::NotFound(what),
            StorageError::Backend(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}

impl From<ProjectionError> for EngineError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::HandlerFailed(msg) => EngineError::ProjectionHandlerFailure(msg),
            ProjectionError::NotFound(name) => {
                EngineError::NotFound(format!("projection '{name}'"))
            }
            ProjectionError::Storage(e) => e.into(),
        }
    }
}
