//! Integration tests for the event store and aggregate reconstruction
//! against both storage backends (S1, S2, S4 and invariants I1, I2, I4).

use std::sync::Arc;

use event_sourcing_engine::event::Payload;
use event_sourcing_engine::store::{InMemoryStorage, SqliteStorage, Storage};
use event_sourcing_engine::{AggregateRegistry, EngineError, Event, EventStore};

async fn backends() -> Vec<Arc<dyn Storage>> {
    vec![
        Arc::new(InMemoryStorage::new()),
        Arc::new(SqliteStorage::connect(":memory:", 1).await.unwrap()),
    ]
}

fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    let mut map = Payload::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    map
}

#[tokio::test]
async fn s1_basic_append_and_load() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        let events = vec![Event::create(
            "o1",
            "Order",
            "Created",
            payload(&[("total", 10.into())]),
            1,
            None,
        )];
        store.append("o1", events).await.unwrap();

        let loaded = store.load("o1", 0).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event_type, "Created");
        assert_eq!(store.get_position().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn s2_version_conflict_leaves_the_log_untouched() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        store
            .append("o1", vec![Event::create("o1", "Order", "Created", Payload::new(), 1, None)])
            .await
            .unwrap();

        let err = store
            .append("o1", vec![Event::create("o1", "Order", "Created", Payload::new(), 1, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { .. }));

        let loaded = store.load("o1", 0).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}

#[tokio::test]
async fn i1_versions_are_contiguous_with_no_gaps_or_duplicates() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        store
            .append(
                "o1",
                vec![
                    Event::create("o1", "Order", "A", Payload::new(), 1, None),
                    Event::create("o1", "Order", "B", Payload::new(), 2, None),
                    Event::create("o1", "Order", "C", Payload::new(), 3, None),
                ],
            )
            .await
            .unwrap();

        let loaded = store.load("o1", 0).await.unwrap();
        let versions: Vec<i64> = loaded.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn i1_non_contiguous_batch_is_rejected_atomically() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        store
            .append("o1", vec![Event::create("o1", "Order", "Created", Payload::new(), 1, None)])
            .await
            .unwrap();

        let batch = vec![
            Event::create("o1", "Order", "Paid", Payload::new(), 2, None),
            Event::create("o1", "Order", "Shipped", Payload::new(), 4, None), // skips 3
        ];
        let err = store.append("o1", batch).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { .. }));
        assert_eq!(store.current_version("o1").await.unwrap(), 1);
    }
}

#[tokio::test]
async fn i2_position_is_strictly_increasing_and_never_reused() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        store
            .append("a", vec![Event::create("a", "T", "E", Payload::new(), 1, None)])
            .await
            .unwrap();
        store
            .append("b", vec![Event::create("b", "T", "E", Payload::new(), 1, None)])
            .await
            .unwrap();
        store
            .append("a", vec![Event::create("a", "T", "E", Payload::new(), 2, None)])
            .await
            .unwrap();

        let all = store.load_all_events(0).await.unwrap();
        let positions: Vec<i64> = all.iter().map(|e| e.position).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert_eq!(positions.len(), 3);
        assert_eq!(store.get_position().await.unwrap(), *positions.last().unwrap());
    }
}

#[tokio::test]
async fn s4_snapshot_plus_delta_reconstructs_full_state() {
    for storage in backends().await {
        let mut aggregates = AggregateRegistry::new();
        aggregates.register("Order", |state, event| {
            let current = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            serde_json::json!({ "n": current + 1 })
        });
        let store = EventStore::new(storage, aggregates);

        let first_five: Vec<Event> = (1..=5)
            .map(|v| Event::create("o1", "Order", "Tick", Payload::new(), v, None))
            .collect();
        store.append("o1", first_five).await.unwrap();

        let snapshot = store.create_snapshot("o1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 5);

        store
            .append(
                "o1",
                vec![
                    Event::create("o1", "Order", "Tick", Payload::new(), 6, None),
                    Event::create("o1", "Order", "Tick", Payload::new(), 7, None),
                ],
            )
            .await
            .unwrap();

        let aggregate = store.reconstruct("o1", "Order").await.unwrap();
        assert_eq!(aggregate.version, 7);
        assert_eq!(aggregate.state["n"], serde_json::json!(7));
    }
}

#[tokio::test]
async fn i4_reconstruct_is_identical_with_or_without_a_snapshot() {
    for storage in backends().await {
        let mut aggregates = AggregateRegistry::new();
        aggregates.register("Counter", |state, event| {
            let current = state.get("total").and_then(|v| v.as_i64()).unwrap_or(0);
            let delta = event.payload.get("delta").and_then(|v| v.as_i64()).unwrap_or(0);
            serde_json::json!({ "total": current + delta })
        });
        let store = EventStore::new(storage, aggregates);

        store
            .append(
                "c1",
                vec![
                    Event::create("c1", "Counter", "Incremented", payload(&[("delta", 3.into())]), 1, None),
                    Event::create("c1", "Counter", "Incremented", payload(&[("delta", 2.into())]), 2, None),
                ],
            )
            .await
            .unwrap();

        let without_snapshot = store.reconstruct("c1", "Counter").await.unwrap();
        store.create_snapshot("c1").await.unwrap();
        let with_snapshot = store.reconstruct("c1", "Counter").await.unwrap();

        assert_eq!(without_snapshot.state, with_snapshot.state);
        assert_eq!(without_snapshot.version, with_snapshot.version);
    }
}

#[tokio::test]
async fn create_snapshot_on_aggregate_with_no_events_is_none() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        assert!(store.create_snapshot("ghost").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn untyped_aggregate_falls_back_to_payload_merge() {
    for storage in backends().await {
        let store = EventStore::new(storage, AggregateRegistry::new());
        store
            .append(
                "u1",
                vec![Event::create(
                    "u1",
                    "Unregistered",
                    "Seen",
                    payload(&[("label", "first".into())]),
                    1,
                    None,
                )],
            )
            .await
            .unwrap();

        let aggregate = store.reconstruct("u1", "Unregistered").await.unwrap();
        assert_eq!(aggregate.state["label"], serde_json::json!("first"));
    }
}
