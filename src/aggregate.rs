//! Aggregates.
//!
//! `spec.md` §3.2/§9 deliberately models an aggregate as data plus a
//! registered apply function rather than as a per-domain Rust type: the
//! engine has no generic parameter for "the" aggregate type, so a single
//! host process can register as many aggregate types as it likes at
//! runtime. Concrete domains that want a typed view project `state`
//! themselves after reconstruction.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::event::Event;

/// A function that folds one event into an aggregate's JSON state.
///
/// Registered per aggregate type via [`AggregateRegistry::register`]. If
/// no function is registered for a type, [`Aggregate::apply`] falls back
/// to the default policy described in `spec.md` §3.2: shallow-merge the
/// event payload's keys into the state object.
pub type ApplyFn = Arc<dyn Fn(&Value, &Event) -> Value + Send + Sync>;

/// The current materialized view of one aggregate instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub id: String,
    pub aggregate_type: String,
    pub version: i64,
    pub state: Value,
}

impl Aggregate {
    /// The empty aggregate an id starts from before any event is applied.
    pub fn empty(id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            version: 0,
            state: Value::Object(Default::default()),
        }
    }

    /// Fold one event into this aggregate, using `apply_fn` if given or
    /// the default shallow-merge policy otherwise. Panics are never
    /// raised here; a handler that wants to reject a state transition
    /// should do so before raising the event, not inside apply.
    pub fn apply(&mut self, event: &Event, apply_fn: Option<&ApplyFn>) {
        let next_state = match apply_fn {
            Some(f) => f(&self.state, event),
            None => default_apply(&self.state, event),
        };
        self.state = next_state;
        self.version = event.version;
    }

    /// Increment this aggregate's version, construct the corresponding
    /// `Event`, apply it locally, and return it (`spec.md` §4.2).
    /// Persisting the returned event via `EventStore::append` is the
    /// caller's responsibility; `raise_event` never touches storage.
    pub fn raise_event(
        &mut self,
        event_type: impl Into<String>,
        payload: crate::event::Payload,
        caused_by: Option<String>,
        apply_fn: Option<&ApplyFn>,
    ) -> Event {
        let event = Event::create(
            self.id.clone(),
            self.aggregate_type.clone(),
            event_type,
            payload,
            self.version + 1,
            caused_by,
        );
        self.apply(&event, apply_fn);
        event
    }
}

/// The default apply policy used when an aggregate type has no
/// registered handler: merge the event payload's top-level keys into
/// the state object (`spec.md` §3.2 "Default/untyped behavior").
fn default_apply(state: &Value, event: &Event) -> Value {
    let mut merged = match state {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in &event.payload {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// A registry of per-aggregate-type apply functions, consulted by
/// [`crate::event_store::EventStore::reconstruct`].
///
/// Thread-safe and cheaply cloneable; a host typically builds one at
/// startup and shares it with the `EventStore`.
#[derive(Clone, Default)]
pub struct AggregateRegistry {
    handlers: HashMap<String, ApplyFn>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the apply function for `aggregate_type`. Replaces any
    /// previously registered function for the same type.
    pub fn register(
        &mut self,
        aggregate_type: impl Into<String>,
        apply_fn: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static,
    ) {
        self.handlers.insert(aggregate_type.into(), Arc::new(apply_fn));
    }

    pub fn get(&self, aggregate_type: &str) -> Option<&ApplyFn> {
        self.handlers.get(aggregate_type)
    }
}
