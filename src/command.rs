//! Command Bus: dispatch with an audit trail.
//!
//! `spec.md` §4.4 specifies a 5-step dispatch protocol: construct a
//! `Command` and record it as `pending`, invoke its registered handler
//! with the command and a handle onto the event store, catch any
//! failure rather than propagating it, update the audit row with the
//! outcome, and return a [`DispatchOutcome`] rather than an
//! `EngineResult`: a failed handler is a normal, auditable outcome, not
//! an engine error.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::event_store::EventStore;
use crate::store::{CommandRow, Storage, StorageError};

/// One command, constructed by [`CommandBus::dispatch`] and handed to
/// its registered handler.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub command_type: String,
    pub payload: Value,
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// A command handler: given the constructed `Command` and a handle onto
/// the event store (so it can `load`/`append`), performs some side
/// effect and returns a JSON result on success (`spec.md` §4.4
/// `register`: `handler` has signature `(Command, EventStore) →
/// result_mapping`).
pub type CommandHandler = Box<
    dyn Fn(Command, Arc<EventStore>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync,
>;

/// The persisted, terminal result of one dispatch (`spec.md` §4.4).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub command_id: String,
    pub status: CommandStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Error,
}

/// Routes commands to registered handlers and records every dispatch.
pub struct CommandBus {
    storage: Arc<dyn Storage>,
    event_store: Arc<EventStore>,
    handlers: HashMap<String, CommandHandler>,
}

impl CommandBus {
    pub fn new(storage: Arc<dyn Storage>, event_store: Arc<EventStore>) -> Self {
        Self {
            storage,
            event_store,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `command_type`. Replaces any previously
    /// registered handler for the same type.
    pub fn register(&mut self, command_type: impl Into<String>, handler: CommandHandler) {
        self.handlers.insert(command_type.into(), handler);
    }

    /// Dispatch a command through its registered handler, per the
    /// 5-step protocol:
    /// 1. Construct a `Command` with a fresh id and current timestamp.
    /// 2. Insert an audit row with `status = "pending"`.
    /// 3. Look up the handler for `command_type`; if none is
    ///    registered, record and return an error outcome without
    ///    invoking anything.
    /// 4. Invoke it, catching panics as well as returned errors.
    /// 5. Persist the outcome (`ok` or `error`) as a separate write
    ///    from any event appends the handler performed, the audit row
    ///    is advisory, not atomic with the handler's own effects.
    #[instrument(skip(self, payload), fields(command_type = %command_type.as_ref()))]
    pub async fn dispatch(
        &self,
        command_type: impl AsRef<str>,
        payload: Value,
        issued_by: Option<String>,
    ) -> Result<DispatchOutcome, StorageError> {
        let command = Command {
            id: Uuid::new_v4().to_string(),
            command_type: command_type.as_ref().to_string(),
            payload,
            issued_by,
            issued_at: Utc::now(),
        };

        self.storage
            .insert_command(CommandRow {
                id: command.id.clone(),
                command_type: command.command_type.clone(),
                payload: command.payload.clone(),
                issued_by: command.issued_by.clone(),
                issued_at: command.issued_at,
                status: "pending".to_string(),
                result: None,
                error_message: None,
            })
            .await?;

        let (status, result, error_message) = match self.handlers.get(&command.command_type) {
            Some(handler) => {
                let fut = AssertUnwindSafe(handler(command.clone(), self.event_store.clone()))
                    .catch_unwind();
                match fut.await {
                    Ok(Ok(result)) => (CommandStatus::Ok, Some(result), None),
                    Ok(Err(message)) => (CommandStatus::Error, None, Some(message)),
                    Err(_) => (
                        CommandStatus::Error,
                        None,
                        Some("command handler panicked".to_string()),
                    ),
                }
            }
            None => (
                CommandStatus::Error,
                None,
                Some(format!("no handler for {}", command.command_type)),
            ),
        };

        let status_str = match status {
            CommandStatus::Ok => "ok",
            CommandStatus::Error => "error",
        };

        self.storage
            .update_command(&command.id, status_str, result.clone(), error_message.clone())
            .await?;

        match status {
            CommandStatus::Ok => info!(command_id = %command.id, "command dispatched"),
            CommandStatus::Error => {
                error!(command_id = %command.id, error = error_message.as_deref().unwrap_or(""), "command failed")
            }
        }

        Ok(DispatchOutcome {
            command_id: command.id,
            status,
            result,
            error_message,
        })
    }

    /// Fetch the audit record for a previously dispatched command.
    pub async fn load_record(&self, command_id: &str) -> Result<Option<CommandRow>, StorageError> {
        self.storage.load_command(command_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateRegistry;
    use crate::store::InMemoryStorage;

    fn bus() -> CommandBus {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let event_store = Arc::new(EventStore::new(storage.clone(), AggregateRegistry::new()));
        CommandBus::new(storage, event_store)
    }

    #[tokio::test]
    async fn successful_dispatch_is_recorded_ok() {
        let mut bus = bus();
        bus.register(
            "Greet",
            Box::new(|command, _store| {
                async move { Ok(serde_json::json!({ "greeting": format!("hi {}", command.payload) })) }
                    .boxed()
            }),
        );

        let outcome = bus.dispatch("Greet", serde_json::json!("world"), None).await.unwrap();

        assert_eq!(outcome.status, CommandStatus::Ok);
        let record = bus.load_record(&outcome.command_id).await.unwrap().unwrap();
        assert_eq!(record.status, "ok");
    }

    #[tokio::test]
    async fn handler_can_append_events_through_the_event_store() {
        let mut bus = bus();
        bus.register(
            "CreateOrder",
            Box::new(|command, store| {
                async move {
                    let id = command.payload["id"].as_str().unwrap_or("unknown").to_string();
                    let mut payload = crate::event::Payload::new();
                    payload.insert("id".to_string(), serde_json::json!(id.clone()));
                    let event = crate::event::Event::create(&id, "Order", "Created", payload, 1, Some(command.id.clone()));
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
        assert_eq!(outcome.result.unwrap()["id"], serde_json::json!("o9"));
    }

    #[tokio::test]
    async fn handler_error_is_recorded_not_propagated() {
        let mut bus = bus();
        bus.register(
            "Fail",
            Box::new(|_, _| async move { Err("boom".to_string()) }.boxed()),
        );

        let outcome = bus.dispatch("Fail", Value::Null, None).await.unwrap();

        assert_eq!(outcome.status, CommandStatus::Error);
        assert_eq!(outcome.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error_outcome_not_a_panic() {
        let bus = bus();
        let outcome = bus.dispatch("Unknown", Value::Null, None).await.unwrap();

        assert_eq!(outcome.status, CommandStatus::Error);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("no handler for Unknown")
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
}
