//! Integration tests for the command bus dispatch protocol and audit
//! trail (S5, S6).

use std::sync::Arc;

use event_sourcing_engine::command::CommandStatus;
use event_sourcing_engine::event::{Event, Payload};
use event_sourcing_engine::store::InMemoryStorage;
use event_sourcing_engine::{AggregateRegistry, CommandBus, EventStore};
use futures::FutureExt;
use serde_json::Value;

fn bus() -> CommandBus {
    let storage: Arc<dyn event_sourcing_engine::Storage> = Arc::new(InMemoryStorage::new());
    let event_store = Arc::new(EventStore::new(storage.clone(), AggregateRegistry::new()));
    CommandBus::new(storage, event_store)
}

#[tokio::test]
async fn s5_command_dispatch_success_appends_event_and_records_ok() {
    let mut bus = bus();
    bus.register(
        "CreateOrder",
        Box::new(|command, store| {
            async move {
                let id = command.payload["id"].as_str().unwrap().to_string();
                let mut payload = Payload::new();
                payload.insert("total".to_string(), command.payload["total"].clone());
                let event = Event::create(&id, "Order", "OrderCreated", payload, 1, Some(command.id.clone()));
                store.append(&id, vec![event]).await.map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "id": id }))
            }
            .boxed()
        }),
    );

    let outcome = bus
        .dispatch("CreateOrder", serde_json::json!({ "id": "o9", "total": 5 }), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, CommandStatus::Ok);
    assert_eq!(outcome.result, Some(serde_json::json!({ "id": "o9" })));

    let record = bus.load_record(&outcome.command_id).await.unwrap().unwrap();
    assert_eq!(record.status, "ok");
}

#[tokio::test]
async fn s6_command_dispatch_with_no_handler_records_error() {
    let bus = bus();

    let outcome = bus.dispatch("Unknown", serde_json::json!({}), None).await.unwrap();

    assert_eq!(outcome.status, CommandStatus::Error);
    assert_eq!(outcome.error_message.as_deref(), Some("no handler for Unknown"));

    let record = bus.load_record(&outcome.command_id).await.unwrap().unwrap();
    assert_eq!(record.status, "error");
    assert_eq!(record.result, None);
}

#[tokio::test]
async fn handler_failure_is_captured_as_an_error_outcome() {
    let mut bus = bus();
    bus.register(
        "CloseAccount",
        Box::new(|_, _| async move { Err("account has a positive balance".to_string()) }.boxed()),
    );

    let outcome = bus.dispatch("CloseAccount", serde_json::json!({}), None).await.unwrap();

    assert_eq!(outcome.status, CommandStatus::Error);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("account has a positive balance")
    );
}

#[tokio::test]
async fn panicking_handler_is_recorded_not_propagated() {
    let mut bus = bus();
    bus.register("Explode", Box::new(|_, _| async move { panic!("handler bug") }.boxed()));

    let outcome = bus.dispatch("Explode", Value::Null, None).await.unwrap();

    assert_eq!(outcome.status, CommandStatus::Error);
    assert!(outcome.error_message.unwrap().contains("panicked"));
}

#[tokio::test]
async fn every_dispatch_gets_a_distinct_audit_id() {
    let mut bus = bus();
    bus.register("Ping", Box::new(|_, _| async move { Ok(serde_json::json!("pong")) }.boxed()));

    let first = bus.dispatch("Ping", serde_json::json!({}), None).await.unwrap();
    let second = bus.dispatch("Ping", serde_json::json!({}), None).await.unwrap();

    assert_ne!(first.command_id, second.command_id);
}
