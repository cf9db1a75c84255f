//! Idempotent graph upserts against the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use logos_rs::driver::{GraphStore, InMemoryGraphStore};
use logos_rs::edges::GraphEdge;
use logos_rs::errors::UpsertError;
use logos_rs::memory::MemoryTier;
use logos_rs::schema::{DeprecationPolicy, MemorySchemaStore, SchemaRegistry};
use logos_rs::upsert::{BatchStatus, ChangeKind, UpsertConfig, UpsertEngine, UpsertOperation};
use serde_json::{json, Value};

fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn engine() -> (Arc<UpsertEngine>, Arc<InMemoryGraphStore>, Arc<SchemaRegistry>) {
    let schema = Arc::new(
        SchemaRegistry::load(MemorySchemaStore::default(), DeprecationPolicy::Block).unwrap(),
    );
    let store = Arc::new(InMemoryGraphStore::new());
    let engine = UpsertEngine::new(
        schema.clone(),
        store.clone(),
        UpsertConfig {
            allow_schema_growth: true,
        },
    );
    (Arc::new(engine), store, schema)
}

#[tokio::test]
async fn second_write_wins_and_creation_is_kept() {
    let (engine, store, _) = engine();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let t1 = t0 + Duration::hours(2);

    let first = engine
        .apply_at(
            &[UpsertOperation::node(
                "Company",
                "c_001",
                props(&[("name", json!("Acme")), ("status", json!("lead"))]),
            )],
            "alice",
            t0,
        )
        .await;
    assert_eq!(first.applied[0].change, ChangeKind::Created);

    let second = engine
        .apply_at(
            &[UpsertOperation::node(
                "Company",
                "c_001",
                props(&[("status", json!("customer"))]),
            )],
            "bob",
            t1,
        )
        .await;
    assert_eq!(second.applied[0].change, ChangeKind::Updated);

    let node = store.get_node("c_001").await.unwrap().unwrap();
    assert_eq!(node.properties, props(&[("status", json!("customer"))]));
    assert_eq!(node.version, 2);
    assert_eq!(node.provenance.created_at, t0);
    assert_eq!(node.provenance.created_by, "alice");
    assert_eq!(node.provenance.updated_at, t1);
    assert_eq!(node.provenance.updated_by, "bob");
}

#[tokio::test]
async fn replaying_a_batch_changes_nothing() {
    let (engine, store, schema) = engine();
    let batch = vec![
        UpsertOperation::node("Person", "p_1", props(&[("name", json!("Jane Doe"))])),
        UpsertOperation::node("Company", "c_001", props(&[("name", json!("Acme"))])),
        UpsertOperation::relationship("works for", "p_1", "c_001", BTreeMap::new()),
    ];

    let first = engine.apply(&batch, "tester").await;
    assert_eq!(first.status, BatchStatus::Complete);
    assert_eq!(first.count(ChangeKind::Created), 3);
    let version_after_first = schema.version();

    let second = engine.apply(&batch, "tester").await;
    assert_eq!(second.count(ChangeKind::Unchanged), 3);
    assert_eq!(store.node_count(), 2);
    assert_eq!(store.edge_count(), 1);

    let edge_id = GraphEdge::derive_id("WORKS_FOR", "p_1", "c_001");
    let edge = store.get_edge(&edge_id).await.unwrap().unwrap();
    assert_eq!(edge.version, 1);

    // Usage is still recorded on replays.
    assert!(schema.version() > version_after_first);
    assert_eq!(schema.resolve("Person").unwrap().usage_count, 2);
}

#[tokio::test]
async fn dangling_endpoint_rejects_the_whole_batch() {
    let (engine, store, _) = engine();
    let batch = vec![
        UpsertOperation::node("Person", "p_1", props(&[("name", json!("Jane Doe"))])),
        UpsertOperation::relationship("WORKS_FOR", "p_1", "ghost", BTreeMap::new()),
    ];

    let result = engine.apply(&batch, "tester").await;
    assert_eq!(result.status, BatchStatus::Rejected);
    assert!(result.applied.is_empty());
    assert!(matches!(
        result.failed[0].error,
        UpsertError::NotAttempted { .. }
    ));
    assert!(matches!(
        &result.failed[1].error,
        UpsertError::DanglingReference { endpoint } if endpoint == "ghost"
    ));
    assert_eq!(store.node_count(), 0);
}

#[tokio::test]
async fn deprecated_type_is_blocked_per_operation() {
    let (engine, store, schema) = engine();
    engine
        .apply(
            &[UpsertOperation::node("Lead", "l_1", BTreeMap::new())],
            "tester",
        )
        .await;
    schema.deprecate("Lead", "merged into Person").unwrap();

    let result = engine
        .apply(
            &[
                UpsertOperation::node("Lead", "l_2", BTreeMap::new()),
                UpsertOperation::node("Person", "p_1", BTreeMap::new()),
            ],
            "tester",
        )
        .await;
    assert_eq!(result.status, BatchStatus::Partial);
    assert!(matches!(
        &result.failed[0].error,
        UpsertError::DeprecatedTypeWrite { reason, .. } if reason == "merged into Person"
    ));
    assert!(store.get_node("p_1").await.unwrap().is_some());
    assert!(store.get_node("l_2").await.unwrap().is_none());
}

#[tokio::test]
async fn mid_term_operations_never_reach_the_store() {
    let (engine, store, _) = engine();
    let op = UpsertOperation::node("Person", "p_1", BTreeMap::new()).with_tier(MemoryTier::MidTerm);

    let result = engine.apply(&[op], "tester").await;
    assert!(matches!(
        result.failed[0].error,
        UpsertError::NotLongTerm {
            tier: MemoryTier::MidTerm
        }
    ));
    assert_eq!(store.node_count(), 0);
}

#[tokio::test]
async fn store_failure_stops_the_batch() {
    let (engine, store, _) = engine();
    store.fail_next_writes(1);
    let batch = vec![
        UpsertOperation::node("Person", "p_1", BTreeMap::new()),
        UpsertOperation::node("Person", "p_2", BTreeMap::new()),
    ];

    let result = engine.apply(&batch, "tester").await;
    assert_eq!(result.status, BatchStatus::Rejected);
    assert!(matches!(result.failed[0].error, UpsertError::Store { .. }));
    assert!(matches!(
        result.failed[1].error,
        UpsertError::NotAttempted { .. }
    ));
    assert_eq!(store.node_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replays_converge_on_one_node() {
    let (engine, store, _) = engine();
    let batch = vec![UpsertOperation::node(
        "Person",
        "p_1",
        props(&[("name", json!("Jane Doe"))]),
    )];

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let batch = batch.clone();
        handles.push(tokio::spawn(async move {
            engine.apply(&batch, &format!("worker-{i}")).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        for failure in &result.failed {
            assert!(matches!(failure.error, UpsertError::UpsertConflict { .. }));
        }
    }

    let node = store.get_node("p_1").await.unwrap().unwrap();
    assert_eq!(store.node_count(), 1);
    assert_eq!(node.version, 1);
}
