//! Event Store: the append-only log plus aggregate reconstruction.
//!
//! Wraps a [`Storage`] backend with the domain-level operations from
//! `spec.md` §4.1: `append`, `load`, `load_all`, `load_all_events`,
//! `get_position`, snapshotting and `reconstruct`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRegistry};
use crate::error::{EngineError, EngineResult};
use crate::event::{Event, Payload};
use crate::store::{NewEvent, SnapshotRow, Storage};

/// The event store: an append-only log over a [`Storage`] backend, with
/// aggregate reconstruction built on top.
pub struct EventStore {
    storage: Arc<dyn Storage>,
    aggregates: AggregateRegistry,
    /// Number of events since the last snapshot before `reconstruct`
    /// takes one automatically. `0` disables automatic snapshotting.
    snapshot_interval: u32,
}

impl EventStore {
    pub fn new(storage: Arc<dyn Storage>, aggregates: AggregateRegistry) -> Self {
        Self {
            storage,
            aggregates,
            snapshot_interval: 0,
        }
    }

    pub fn with_snapshot_interval(mut self, interval: u32) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Append one or more events for a single aggregate (`spec.md` §4.1
    /// `append`). `events` must already carry contiguous ascending
    /// versions starting at `current_max_version(aggregate_id) + 1`
    /// (this is what `Aggregate::raise_event` produces); the store
    /// verifies this itself rather than trusting the caller, failing
    /// the whole batch atomically without partial writes on a mismatch
    /// (I1, I3).
    #[instrument(skip(self, events), fields(aggregate_id))]
    pub async fn append(&self, aggregate_id: &str, events: Vec<Event>) -> EngineResult<Vec<Event>> {
        if events.is_empty() {
            return Err(EngineError::InvalidAppend(
                "append called with no events".to_string(),
            ));
        }

        let new_events: Vec<NewEvent> = events
            .iter()
            .map(|e| NewEvent {
                id: e.id.clone(),
                aggregate_id: e.aggregate_id.clone(),
                aggregate_type: e.aggregate_type.clone(),
                event_type: e.event_type.clone(),
                payload: Value::Object(e.payload.clone()),
                version: e.version,
                timestamp: e.timestamp,
                caused_by: e.caused_by.clone(),
                metadata: e.metadata.clone().map(Value::Object),
            })
            .collect();

        let positions = self.storage.append_events(aggregate_id, new_events).await?;

        debug!(count = positions.len(), "appended events");

        Ok(events
            .into_iter()
            .zip(positions)
            .map(|(mut e, position)| {
                e.position = position;
                e
            })
            .collect())
    }

    /// Events for one aggregate with `version > from_version`, ascending.
    pub async fn load(&self, aggregate_id: &str, from_version: i64) -> EngineResult<Vec<Event>> {
        let rows = self.storage.load_events(aggregate_id, from_version).await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Events of one aggregate type with `position > after_position`.
    pub async fn load_all(
        &self,
        aggregate_type: &str,
        after_position: i64,
    ) -> EngineResult<Vec<Event>> {
        let rows = self
            .storage
            .load_events_by_type(aggregate_type, after_position)
            .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// The full global stream after `after_position`, the feed
    /// projections subscribe to (`spec.md` §4.1 `load_all_events`).
    pub async fn load_all_events(&self, after_position: i64) -> EngineResult<Vec<Event>> {
        let rows = self.storage.load_all_events(after_position).await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// The highest position assigned so far (I2).
    pub async fn get_position(&self) -> EngineResult<i64> {
        Ok(self.storage.max_position().await?)
    }

    /// Persist a snapshot of an aggregate's current reconstructed state
    /// at its current version (`spec.md` §4.1 `create_snapshot`). If
    /// the aggregate has zero events, returns `Ok(None)` and persists
    /// nothing. `aggregate_type`, absent from this operation's
    /// signature, is resolved from the aggregate's own event stream
    /// instead of being supplied by the caller (see `DESIGN.md`).
    pub async fn create_snapshot(&self, aggregate_id: &str) -> EngineResult<Option<SnapshotRow>> {
        let Some(aggregate_type) = self.storage.aggregate_type_of(aggregate_id).await? else {
            return Ok(None);
        };

        let aggregate = self.reconstruct(aggregate_id, &aggregate_type).await?;

        let snapshot = SnapshotRow {
            aggregate_id: aggregate.id,
            aggregate_type: aggregate.aggregate_type,
            version: aggregate.version,
            state: aggregate.state,
            created_at: Utc::now(),
        };
        self.storage.save_snapshot(snapshot.clone()).await?;
        Ok(Some(snapshot))
    }

    /// The latest snapshot for an aggregate, if one has been taken.
    pub async fn load_snapshot(&self, aggregate_id: &str) -> EngineResult<Option<SnapshotRow>> {
        Ok(self.storage.load_latest_snapshot(aggregate_id).await?)
    }

    /// Reconstruct an aggregate's current state (I4, `spec.md` §4.1
    /// `reconstruct`): start from the latest snapshot if one exists,
    /// then replay every event with a higher version through the
    /// registered apply function for `aggregate_type` (or the default
    /// merge policy if none is registered).
    #[instrument(skip(self))]
    pub async fn reconstruct(&self, aggregate_id: &str, aggregate_type: &str) -> EngineResult<Aggregate> {
        let snapshot = self.storage.load_latest_snapshot(aggregate_id).await?;

        let mut aggregate = match &snapshot {
            Some(s) => Aggregate {
                id: s.aggregate_id.clone(),
                aggregate_type: s.aggregate_type.clone(),
                version: s.version,
                state: s.state.clone(),
            },
            None => Aggregate::empty(aggregate_id, aggregate_type),
        };

        let from_version = snapshot.map(|s| s.version).unwrap_or(0);
        let events = self.load(aggregate_id, from_version).await?;

        let apply_fn = self.aggregates.get(&aggregate.aggregate_type).cloned();
        for event in &events {
            aggregate.apply(event, apply_fn.as_ref());
        }

        if self.snapshot_interval > 0 && events.len() as u32 >= self.snapshot_interval {
            self.storage
                .save_snapshot(SnapshotRow {
                    aggregate_id: aggregate.id.clone(),
                    aggregate_type: aggregate.aggregate_type.clone(),
                    version: aggregate.version,
                    state: aggregate.state.clone(),
                    created_at: Utc::now(),
                })
                .await?;
        }

        Ok(aggregate)
    }

    /// Convenience: fetch the current version of an aggregate without
    /// reconstructing its full state.
    pub async fn current_version(&self, aggregate_id: &str) -> EngineResult<i64> {
        Ok(self.storage.current_version(aggregate_id).await?)
    }

    /// Build a batch of not-yet-persisted events for `aggregate_id`,
    /// assigning contiguous versions starting right after
    /// `current_version`. A convenience wrapper around `Event::create`
    /// for callers that don't want to track versions themselves.
    pub fn raise_events(
        aggregate_id: &str,
        aggregate_type: &str,
        current_version: i64,
        events: Vec<(String, Payload)>,
        caused_by: Option<String>,
    ) -> Vec<Event> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, (event_type, payload))| {
                Event::create(
                    aggregate_id,
                    aggregate_type,
                    event_type,
                    payload,
                    current_version + 1 + i as i64,
                    caused_by.clone(),
                )
            })
            .collect()
    }
}

fn row_to_event(row: crate::store::EventRow) -> EngineResult<Event> {
    let payload = match row.payload {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    let metadata = match row.metadata {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };
    Ok(Event {
        id: row.id,
        aggregate_id: row.aggregate_id,
        aggregate_type: row.aggregate_type,
        event_type: row.event_type,
        payload,
        version: row.version,
        timestamp: row.timestamp,
        caused_by: row.caused_by,
        metadata,
        position: row.position,
    })
}

/// Generate a fresh, globally unique aggregate id.
pub fn new_aggregate_id() -> String {
    Uuid::new_v4().to_string()
}
