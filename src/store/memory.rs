//! Lock-based, non-durable [`Storage`] implementation.
//!
//! Mirrors the SQLite backend's contract exactly but keeps everything in
//! `parking_lot`-guarded `Vec`/`HashMap`s. Useful for unit tests and for
//! embedding hosts that want event sourcing semantics without a
//! filesystem dependency at all.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use super::{CommandRow, EventRow, NewEvent, ProjectionRow, SnapshotRow, Storage, StorageError};

#[derive(Default)]
struct State {
    events: Vec<EventRow>,
    snapshots: HashMap<String, Vec<SnapshotRow>>,
    projections: HashMap<String, ProjectionRow>,
    commands: HashMap<String, CommandRow>,
}

#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<i64>, StorageError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.write();

        let current_version = state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(0);

        let mut next_version = current_version;
        for event in &events {
            next_version += 1;
            if event.version != next_version {
                return Err(StorageError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected: next_version,
                    actual: event.version,
                });
            }
        }

        let mut positions = Vec::with_capacity(events.len());
        for event in events {
            let position = state.events.len() as i64 + 1;
            state.events.push(EventRow {
                position,
                id: event.id,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                event_type: event.event_type,
                payload: event.payload,
                version: event.version,
                timestamp: event.timestamp,
                caused_by: event.caused_by,
                metadata: event.metadata,
            });
            positions.push(position);
        }

        Ok(positions)
    }

    async fn load_events(
        &self,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRow>, StorageError> {
        let state = self.state.read();
        Ok(state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.version > from_version)
            .cloned()
            .collect())
    }

    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        after_position: i64,
    ) -> Result<Vec<EventRow>, StorageError> {
        let state = self.state.read();
        Ok(state
            .events
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.position > after_position)
            .cloned()
            .collect())
    }

    async fn load_all_events(&self, after_position: i64) -> Result<Vec<EventRow>, StorageError> {
        let state = self.state.read();
        Ok(state
            .events
            .iter()
            .filter(|e| e.position > after_position)
            .cloned()
            .collect())
    }

    async fn max_position(&self) -> Result<i64, StorageError> {
        Ok(self.state.read().events.last().map(|e| e.position).unwrap_or(0))
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<i64, StorageError> {
        Ok(self
            .state
            .read()
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(0))
    }

    async fn aggregate_type_of(&self, aggregate_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .state
            .read()
            .events
            .iter()
            .find(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.aggregate_type.clone()))
    }

    async fn save_snapshot(&self, snapshot: SnapshotRow) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let list = state.snapshots.entry(snapshot.aggregate_id.clone()).or_default();
        list.retain(|s| s.version != snapshot.version);
        list.push(snapshot);
        Ok(())
    }

    async fn load_latest_snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError> {
        let state = self.state.read();
        Ok(state
            .snapshots
            .get(aggregate_id)
            .and_then(|list| list.iter().max_by_key(|s| s.version).cloned()))
    }

    async fn load_projection(&self, name: &str) -> Result<Option<ProjectionRow>, StorageError> {
        Ok(self.state.read().projections.get(name).cloned())
    }

    async fn save_projection(&self, row: ProjectionRow) -> Result<(), StorageError> {
        self.state.write().projections.insert(row.name.clone(), row);
        Ok(())
    }

    async fn insert_command(&self, row: CommandRow) -> Result<(), StorageError> {
        self.state.write().commands.insert(row.id.clone(), row);
        Ok(())
    }

    async fn update_command(
        &self,
        id: &str,
        status: &str,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let Some(row) = state.commands.get_mut(id) else {
            return Err(StorageError::NotFound(format!("command '{id}'")));
        };
        row.status = status.to_string();
        row.result = result;
        row.error_message = error_message;
        Ok(())
    }

    async fn load_command(&self, id: &str) -> Result<Option<CommandRow>, StorageError> {
        Ok(self.state.read().commands.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: &str, version: i64) -> NewEvent {
        NewEvent {
            id: format!("{aggregate_id}-{version}"),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "Order".to_string(),
            event_type: "Changed".to_string(),
            payload: Value::Null,
            version,
            timestamp: Utc::now(),
            caused_by: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn positions_are_strictly_increasing_across_aggregates() {
        let storage = InMemoryStorage::new();
        storage.append_events("a1", vec![event("a1", 1)]).await.unwrap();
        storage.append_events("a2", vec![event("a2", 1)]).await.unwrap();
        let all = storage.load_all_events(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].position < all[1].position);
    }

    #[tokio::test]
    async fn rejects_non_contiguous_version() {
        let storage = InMemoryStorage::new();
        let err = storage
            .append_events("a1", vec![event("a1", 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
    }
}
