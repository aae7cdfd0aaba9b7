//! Minimal demonstration binary.
//!
//! Boots a storage backend from `Config`, raises a few events against a
//! sample aggregate, dispatches a command through the bus and advances
//! a projection, then prints the resulting statistics. This replaces
//! the HTTP host the original application shipped with; the engine
//! itself has no transport-layer opinions (`spec.md` §1 Non-goals).

use std::collections::HashMap;
use std::sync::Arc;

use event_sourcing_engine::{
    event::Payload, projection::ProjectionHandler, store::InMemoryStorage, store::SqliteStorage,
    store::Storage, AggregateRegistry, Config, Event, EventSourcingSystem,
};
use futures::FutureExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(config: &Config) {
    let default_filter = if config.is_production() {
        "event_sourcing_engine=info"
    } else {
        "event_sourcing_engine=debug"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!(db_path = %config.db_path, "starting event sourcing engine demo");

    let storage: Arc<dyn Storage> = if config.is_in_memory() {
        Arc::new(InMemoryStorage::new())
    } else {
        Arc::new(SqliteStorage::connect(&config.db_path, config.max_connections).await?)
    };

    let mut aggregates = AggregateRegistry::new();
    aggregates.register("Counter", |state, event| {
        let current = state.get("total").and_then(|v| v.as_i64()).unwrap_or(0);
        let delta = event.payload.get("delta").and_then(|v| v.as_i64()).unwrap_or(0);
        serde_json::json!({ "total": current + delta })
    });

    let mut system = EventSourcingSystem::with_snapshot_interval(
        storage,
        aggregates,
        config.snapshot_interval,
    );

    let aggregate_id = "counter-1";
    let mut payload = Payload::new();
    payload.insert("delta".to_string(), serde_json::json!(5));
    let events = vec![Event::create(aggregate_id, "Counter", "Incremented", payload, 1, None)];
    system.append(aggregate_id, events).await?;

    let aggregate = system.reconstruct(aggregate_id, "Counter").await?;
    tracing::info!(state = ?aggregate.state, "reconstructed aggregate");

    let mut handlers: HashMap<String, ProjectionHandler> = HashMap::new();
    handlers.insert(
        "Incremented".to_string(),
        Arc::new(|state, event| {
            let current = state.get("sum").and_then(|v| v.as_i64()).unwrap_or(0);
            let delta = event.payload.get("delta").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "sum": current + delta }))
        }),
    );
    system.register_projection("counter-totals", handlers).await?;
    system.advance_projection("counter-totals").await?;

    system.register_command(
        "IncrementCounter",
        Box::new(|command, _event_store| {
            async move { Ok(serde_json::json!({ "accepted": command.payload })) }.boxed()
        }),
    );
    let outcome = system
        .dispatch_command(
            "IncrementCounter",
            serde_json::json!({ "delta": 5 }),
            Some("demo".to_string()),
        )
        .await?;
    tracing::info!(status = ?outcome.status, "dispatched command");

    let stats = system.statistics().await?;
    tracing::info!(
        total_events = stats.total_events,
        latest_position = stats.latest_position,
        "engine statistics"
    );

    Ok(())
}
