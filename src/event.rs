//! Domain Events
//!
//! An `Event` is an immutable fact about a single aggregate. Events are
//! created once (via [`Event::create`] or `Aggregate::raise_event`) and are
//! never mutated after being handed to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An open mapping of string keys to JSON-shaped values.
///
/// Event payloads, snapshot state and projection state are all modeled
/// this way rather than as a concrete Rust type: the engine itself never
/// needs to know what an `OrderCreated` event looks like, only how to
/// serialize, store and replay it. Concrete aggregates and projection
/// handlers are where payloads get projected into typed views.
pub type Payload = serde_json::Map<String, Value>;

/// An immutable, versioned fact about a single aggregate.
///
/// `position` is assigned by the store on append and is therefore absent
/// (`0`) until the event has actually been persisted; callers never set it
/// themselves (see `spec.md` §3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique identifier. Equality of events is by this field.
    pub id: String,
    /// The aggregate this event belongs to.
    pub aggregate_id: String,
    /// The type name of the aggregate that raised this event.
    pub aggregate_type: String,
    /// Domain-defined event name (e.g. `"OrderCreated"`).
    pub event_type: String,
    /// Structured event data.
    pub payload: Payload,
    /// Aggregate-local sequence number. Strictly increasing by 1 per
    /// aggregate, starting at 1.
    pub version: i64,
    /// UTC timestamp assigned at creation.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the command or external event that produced this
    /// event, if any.
    pub caused_by: Option<String>,
    /// Free-form metadata.
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Store-global monotonic position, assigned on append. `0` until
    /// persisted.
    pub position: i64,
}

impl Event {
    /// Construct a new, not-yet-persisted event.
    ///
    /// `version` must already reflect the aggregate's new version; the
    /// store does not compute it (that is `Aggregate::raise_event`'s job).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Payload,
        version: i64,
        caused_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            version,
            timestamp: Utc::now(),
            caused_by,
            metadata: None,
            position: 0,
        }
    }

    /// Attach metadata, returning `self` for chaining.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_a_fresh_id_and_no_position() {
        let mut payload = Payload::new();
        payload.insert("total".to_string(), serde_json::json!(10));

        let event = Event::create("o1", "Order", "Created", payload, 1, None);

        assert!(!event.id.is_empty());
        assert_eq!(event.aggregate_id, "o1");
        assert_eq!(event.version, 1);
        assert_eq!(event.position, 0);
    }

    #[test]
    fn equality_is_by_id() {
        let e1 = Event::create("o1", "Order", "Created", Payload::new(), 1, None);
        let mut e2 = e1.clone();
        e2.payload.insert("x".into(), serde_json::json!(1));
        assert_eq!(e1.id, e2.id);
        assert_ne!(e1, e2); // full PartialEq still sees the payload change
    }
}
