//! The thin facade tying event store, projections and the command bus
//! together into a single handle (`spec.md` §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::aggregate::{Aggregate, AggregateRegistry};
use crate::command::{CommandBus, CommandHandler, DispatchOutcome};
use crate::error::EngineResult;
use crate::event::Event;
use crate::event_store::EventStore;
use crate::projection::{Projection, ProjectionError, ProjectionHandler, ProjectionManager};
use crate::store::{Storage, StorageError};

/// A single process-wide handle onto the engine: owns the shared
/// storage backend and exposes the event store, projection manager and
/// command bus as one unit. Hosts that need finer-grained control can
/// construct the three components directly instead.
pub struct EventSourcingSystem {
    pub event_store: Arc<EventStore>,
    pub projections: ProjectionManager,
    pub commands: CommandBus,
}

impl EventSourcingSystem {
    pub fn new(storage: Arc<dyn Storage>, aggregates: AggregateRegistry) -> Self {
        Self::with_snapshot_interval(storage, aggregates, 0)
    }

    pub fn with_snapshot_interval(
        storage: Arc<dyn Storage>,
        aggregates: AggregateRegistry,
        snapshot_interval: u32,
    ) -> Self {
        let event_store = Arc::new(
            EventStore::new(storage.clone(), aggregates).with_snapshot_interval(snapshot_interval),
        );
        let projections = ProjectionManager::new(storage.clone(), event_store.clone());
        let commands = CommandBus::new(storage, event_store.clone());

        Self {
            event_store,
            projections,
            commands,
        }
    }

    pub async fn register_projection(
        &mut self,
        name: impl Into<String>,
        handlers: HashMap<String, ProjectionHandler>,
    ) -> Result<(), ProjectionError> {
        self.projections.register(Projection::new(name, handlers)).await
    }

    pub fn register_command(&mut self, command_type: impl Into<String>, handler: CommandHandler) {
        self.commands.register(command_type, handler);
    }

    pub async fn append(&self, aggregate_id: &str, events: Vec<Event>) -> EngineResult<Vec<Event>> {
        self.event_store.append(aggregate_id, events).await
    }

    pub async fn reconstruct(&self, aggregate_id: &str, aggregate_type: &str) -> EngineResult<Aggregate> {
        self.event_store.reconstruct(aggregate_id, aggregate_type).await
    }

    /// Delegates to the command bus (`spec.md` §4.5 `dispatch_command`).
    pub async fn dispatch_command(
        &self,
        command_type: impl AsRef<str>,
        payload: Value,
        issued_by: Option<String>,
    ) -> Result<DispatchOutcome, StorageError> {
        self.commands.dispatch(command_type, payload, issued_by).await
    }

    /// Delegates to the projection manager (`spec.md` §4.5).
    pub async fn rebuild_projection(&self, name: &str) -> Result<i64, ProjectionError> {
        self.projections.rebuild_projection(name).await
    }

    /// Delegates to the projection manager (`spec.md` §4.5).
    pub async fn query_projection(&self, name: &str, key: Option<&str>) -> Result<Value, ProjectionError> {
        self.projections.query_projection(name, key).await
    }

    pub async fn advance_projection(&self, name: &str) -> Result<i64, ProjectionError> {
        self.projections.advance(name).await
    }

    pub async fn advance_all_projections(&self) -> HashMap<String, Result<i64, ProjectionError>> {
        self.projections.advance_all().await
    }

    /// All events for an aggregate, ordered by version (`spec.md` §4.5
    /// `get_aggregate_history`).
    pub async fn get_aggregate_history(&self, aggregate_id: &str) -> EngineResult<Vec<Event>> {
        self.event_store.load(aggregate_id, 0).await
    }

    /// `{total_events, by_type, latest_position}` across the whole
    /// store (`spec.md` §4.5 `statistics`).
    pub async fn statistics(&self) -> EngineResult<SystemStatistics> {
        let events = self.event_store.load_all_events(0).await?;
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for event in &events {
            *by_type.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        let latest_position = events.last().map(|e| e.position).unwrap_or(0);

        Ok(SystemStatistics {
            total_events: events.len() as u64,
            by_type,
            latest_position,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatistics {
    pub total_events: u64,
    pub by_type: HashMap<String, u64>,
    pub latest_position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::store::InMemoryStorage;
    use futures::FutureExt;

    #[tokio::test]
    async fn statistics_counts_events_by_type() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let system = EventSourcingSystem::new(storage, AggregateRegistry::new());

        system
            .append(
                "o1",
                vec![
                    Event::create("o1", "Order", "Created", Payload::new(), 1, None),
                    Event::create("o1", "Order", "Shipped", Payload::new(), 2, None),
                ],
            )
            .await
            .unwrap();
        system
            .append("o2", vec![Event::create("o2", "Order", "Created", Payload::new(), 1, None)])
            .await
            .unwrap();

        let stats = system.statistics().await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.by_type["Created"], 2);
        assert_eq!(stats.by_type["Shipped"], 1);
        assert_eq!(stats.latest_position, 3);
    }

    #[tokio::test]
    async fn get_aggregate_history_is_ordered_by_version() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let system = EventSourcingSystem::new(storage, AggregateRegistry::new());

        system
            .append(
                "o1",
                vec![
                    Event::create("o1", "Order", "Created", Payload::new(), 1, None),
                    Event::create("o1", "Order", "Shipped", Payload::new(), 2, None),
                ],
            )
            .await
            .unwrap();

        let history = system.get_aggregate_history("o1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[1].version, 2);
    }

    #[tokio::test]
    async fn dispatch_command_delegates_to_the_bus() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut system = EventSourcingSystem::new(storage, AggregateRegistry::new());
        system.register_command(
            "Ping",
            Box::new(|_, _| async move { Ok(serde_json::json!("pong")) }.boxed()),
        );

        let outcome = system
            .dispatch_command("Ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(outcome.result, Some(serde_json::json!("pong")));
    }
}
