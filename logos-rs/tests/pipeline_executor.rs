//! End-to-end runs of the built-in workflows over in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logos_rs::bundles::{
    Bundle, BundleKind, BundlePayload, ConsolidationRequest, EntityAction, InteractionMeta,
    RawInput,
};
use logos_rs::driver::{GraphCandidateProvider, GraphStore, InMemoryGraphStore, NodeWrite};
use logos_rs::errors::{LogosError, StageError};
use logos_rs::extract::{JsonExtractor, EXTRACTION_METADATA_KEY};
use logos_rs::memory::{MemoryTier, MemoryTierManager, TierAction};
use logos_rs::pipeline::stages::builtin_registry;
use logos_rs::pipeline::{
    PipelineCatalog, PipelineContext, PipelineDefinition, PipelineExecutor, RetryPolicy,
    RunStatus, Services, Stage, StageContext, Workflow,
};
use logos_rs::resolver::{EntityResolver, ResolutionDecision};
use logos_rs::schema::{DeprecationPolicy, MemorySchemaStore, SchemaRegistry};
use logos_rs::upsert::{UpsertConfig, UpsertEngine};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    services: Arc<Services>,
    store: Arc<InMemoryGraphStore>,
}

fn harness() -> Harness {
    let schema = Arc::new(
        SchemaRegistry::load(MemorySchemaStore::default(), DeprecationPolicy::Warn).unwrap(),
    );
    let store = Arc::new(InMemoryGraphStore::new());
    let services = Services {
        schema: schema.clone(),
        memory: Arc::new(MemoryTierManager::default()),
        resolver: EntityResolver::default(),
        candidates: Arc::new(GraphCandidateProvider::new(store.clone())),
        extractor: Arc::new(JsonExtractor),
        upserts: Arc::new(UpsertEngine::new(
            schema,
            store.clone(),
            UpsertConfig {
                allow_schema_growth: true,
            },
        )),
    };
    Harness {
        services: Arc::new(services),
        store,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

fn raw_bundle(interaction_id: &str) -> Bundle {
    raw_bundle_with(interaction_id, json!({
        "entities": [
            {"temp_id": "m1", "type": "person",
             "attributes": {"name": "Jane Doe", "email": "jane@acme.io"},
             "provenance": {"extraction_confidence": 0.97}},
            {"temp_id": "m2", "type": "organization",
             "attributes": {"name": "Acme Pty Ltd"}}
        ],
        "relationships": [
            {"src": "m1", "dst": "m2", "type": "works for", "confidence": 0.8}
        ],
        "metrics": {"sentiment": 0.4},
        "summary": "Intro call with Jane from Acme"
    }))
}

fn raw_bundle_with(interaction_id: &str, extraction: Value) -> Bundle {
    let mut raw = RawInput {
        text: Some("Call notes: Jane Doe (jane@acme.io) from Acme.".into()),
        ..Default::default()
    };
    raw.metadata.insert(EXTRACTION_METADATA_KEY.to_string(), extraction);
    Bundle::new(InteractionMeta::new(interaction_id), BundlePayload::RawInput(raw))
}

// ---------------------------------------------------------------------------
// Ingest and commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingest_produces_preview_with_tiers() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();

    let run = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();

    assert_eq!(run.log.status, RunStatus::Succeeded);
    assert_eq!(run.log.stages.len(), 6);
    assert_eq!(run.bundle.kind(), BundleKind::Preview);

    let BundlePayload::Preview(preview) = &run.bundle.payload else {
        panic!("expected preview");
    };
    assert_eq!(preview.entities.len(), 2);
    let jane = preview.entities.iter().find(|e| e.temp_id == "m1").unwrap();
    assert_eq!(jane.tier, Some(MemoryTier::LongTerm));
    let acme = preview.entities.iter().find(|e| e.temp_id == "m2").unwrap();
    assert_eq!(acme.tier, Some(MemoryTier::MidTerm));
    assert_eq!(preview.relationships[0].rel_type, "WORKS_FOR");

    // Each stage consumed the previous stage's output.
    for pair in run.log.stages.windows(2) {
        assert_eq!(pair[0].output_bundle_id, Some(pair[1].input_bundle_id));
    }
    let tag = run
        .log
        .stages
        .iter()
        .find(|s| s.stage_id == "memory.tag")
        .unwrap();
    assert_eq!(tag.memory_actions.len(), 2);
    assert!(tag
        .memory_actions
        .iter()
        .all(|a| a.action == TierAction::Tagged));
    assert_eq!(h.store.node_count(), 0);
}

#[tokio::test]
async fn commit_writes_confirmed_entities_and_is_idempotent() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();

    let ingest = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Preview(mut preview) = ingest.bundle.payload.clone() else {
        panic!("expected preview");
    };
    assert!(preview.annotate("m2", EntityAction::Create, None));
    let annotated = ingest.bundle.derive(BundlePayload::Preview(preview));

    let commit = executor
        .run_workflow(Workflow::Commit, annotated.clone(), PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Upsert(payload) = &commit.bundle.payload else {
        panic!("expected upsert");
    };
    let result = payload.result.as_ref().unwrap();
    assert!(result.is_complete(), "{result}");
    assert!(payload.deferred.is_empty());

    // interaction, two entities, two MENTIONS, one WORKS_FOR
    assert_eq!(h.store.node_count(), 3);
    assert_eq!(h.store.edge_count(), 3);
    let interaction = h.store.get_node("interaction_int-1").await.unwrap().unwrap();
    assert_eq!(interaction.text("summary"), Some("Intro call with Jane from Acme"));
    assert!(h.services.schema.resolve("WORKS_FOR").is_ok());

    let again = executor
        .run_workflow(Workflow::Commit, annotated, PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Upsert(payload) = &again.bundle.payload else {
        panic!("expected upsert");
    };
    let result = payload.result.as_ref().unwrap();
    assert_eq!(result.count(logos_rs::upsert::ChangeKind::Created), 0);
    assert_eq!(h.store.node_count(), 3);
    assert_eq!(h.store.edge_count(), 3);
}

#[tokio::test]
async fn second_interaction_resolves_against_the_graph() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();

    let ingest = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();
    executor
        .run_workflow(Workflow::Commit, ingest.bundle, PipelineContext::new("tester"))
        .await
        .unwrap();
    let jane_id = h
        .store
        .nodes_of_type("Person")
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
        .id;

    let second = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-2"), PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Preview(preview) = &second.bundle.payload else {
        panic!("expected preview");
    };
    let jane = preview.entities.iter().find(|e| e.temp_id == "m1").unwrap();
    assert_eq!(jane.canonical_id.as_deref(), Some(jane_id.as_str()));
    assert!((jane.confidence - 1.0).abs() < 1e-9);
}

async fn seed_person(store: &InMemoryGraphStore, id: &str, name: &str) {
    store
        .merge_node(NodeWrite {
            id: id.into(),
            label: "Person".into(),
            properties: [("name".to_string(), json!(name))].into_iter().collect(),
            actor: "seed".into(),
            at: chrono::Utc::now(),
            expected_version: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn unreviewed_matches_are_never_written() {
    let h = harness();
    seed_person(&h.store, "p_1", "Rob Smith").await;
    seed_person(&h.store, "p_3", "Alex Chen").await;
    seed_person(&h.store, "p_9", "Alex Chen").await;
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();

    let extraction = json!({
        "entities": [
            {"temp_id": "m1", "type": "person", "attributes": {"name": "Alex Chen"},
             "provenance": {"extraction_confidence": 0.99}},
            {"temp_id": "m2", "type": "person", "attributes": {"name": "Bob Smith"},
             "provenance": {"extraction_confidence": 0.95}}
        ]
    });
    let ingest = executor
        .run_workflow(
            Workflow::Ingest,
            raw_bundle_with("int-1", extraction),
            PipelineContext::new("tester"),
        )
        .await
        .unwrap();
    let BundlePayload::Preview(preview) = ingest.bundle.payload.clone() else {
        panic!("expected preview");
    };
    let tie = preview.resolution.entity("m1").unwrap().clone();
    assert!(matches!(tie.decision, ResolutionDecision::Ambiguous { .. }));
    let near = preview.resolution.entity("m2").unwrap().clone();
    assert!(near.decision.requires_review());
    assert_eq!(near.decision.canonical_id(), Some("p_1"));
    for entity in &preview.entities {
        assert_eq!(entity.tier, Some(MemoryTier::MidTerm), "{}", entity.temp_id);
    }

    // Committed without annotations: only the interaction is written.
    let commit = executor
        .run_workflow(Workflow::Commit, ingest.bundle.clone(), PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Upsert(payload) = &commit.bundle.payload else {
        panic!("expected upsert");
    };
    assert_eq!(payload.operations.len(), 1);
    assert_eq!(payload.deferred.len(), 2);
    assert_eq!(h.store.nodes_of_type("Person").await.unwrap().len(), 3);
    assert_eq!(h.store.get_node("p_1").await.unwrap().unwrap().version, 1);
    assert_eq!(h.store.edge_count(), 0);

    // Reinforcement does not let consolidation promote them either.
    for artifact in [&tie.artifact_id, &near.artifact_id] {
        for _ in 0..4 {
            h.services.memory.reinforce(artifact, chrono::Utc::now()).unwrap();
        }
    }
    let sweep = Bundle::new(
        InteractionMeta::new("sweep-1"),
        BundlePayload::Consolidation(ConsolidationRequest::now()),
    );
    executor
        .run_workflow(Workflow::Consolidation, sweep, PipelineContext::new("tester"))
        .await
        .unwrap();
    assert_eq!(h.store.nodes_of_type("Person").await.unwrap().len(), 3);
    assert_eq!(h.store.get_node("p_1").await.unwrap().unwrap().version, 1);

    // A reviewer keeping the near match writes it onto the canonical node.
    let mut reviewed = preview;
    assert!(reviewed.annotate("m2", EntityAction::Keep, None));
    let commit = executor
        .run_workflow(
            Workflow::Commit,
            ingest.bundle.derive(BundlePayload::Preview(reviewed)),
            PipelineContext::new("tester"),
        )
        .await
        .unwrap();
    let BundlePayload::Upsert(payload) = &commit.bundle.payload else {
        panic!("expected upsert");
    };
    assert_eq!(payload.deferred, vec![tie.artifact_id.clone()]);
    let p_1 = h.store.get_node("p_1").await.unwrap().unwrap();
    assert_eq!(p_1.version, 2);
    assert_eq!(p_1.text("name"), Some("Bob Smith"));
    assert_eq!(h.store.nodes_of_type("Person").await.unwrap().len(), 3);
    assert_eq!(h.store.edge_count(), 1);
}

// ---------------------------------------------------------------------------
// Consolidation and reasoning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consolidation_runs_on_an_empty_memory() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    let bundle = Bundle::new(
        InteractionMeta::new("sweep-1"),
        BundlePayload::Consolidation(ConsolidationRequest::now()),
    );

    let run = executor
        .run_workflow(Workflow::Consolidation, bundle, PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Upsert(payload) = &run.bundle.payload else {
        panic!("expected upsert");
    };
    assert!(payload.operations.is_empty());
    assert!(payload.result.as_ref().unwrap().is_complete());
}

#[tokio::test]
async fn consolidation_promotes_reinforced_artifacts_into_the_graph() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    let ingest = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();
    let BundlePayload::Preview(preview) = &ingest.bundle.payload else {
        panic!("expected preview");
    };
    let acme = preview.resolution.entity("m2").unwrap().artifact_id.clone();
    for _ in 0..4 {
        h.services.memory.reinforce(&acme, chrono::Utc::now()).unwrap();
    }

    let bundle = Bundle::new(
        InteractionMeta::new("sweep-1"),
        BundlePayload::Consolidation(ConsolidationRequest::now()),
    );
    let run = executor
        .run_workflow(Workflow::Consolidation, bundle, PipelineContext::new("tester"))
        .await
        .unwrap();

    let promote = run
        .log
        .stages
        .iter()
        .find(|s| s.stage_id == "memory.promote")
        .unwrap();
    assert_eq!(promote.memory_actions.len(), 1);
    assert_eq!(promote.memory_actions[0].action, TierAction::Promoted);
    assert_eq!(
        h.services.memory.get(&acme).unwrap().marker.tier,
        MemoryTier::LongTerm
    );
    let orgs = h.store.nodes_of_type("Organization").await.unwrap();
    assert_eq!(orgs.len(), 1);
    assert_eq!(orgs[0].text("name"), Some("Acme Pty Ltd"));
}

#[tokio::test]
async fn reasoning_recalls_tagged_entities() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();

    let run = executor
        .run_workflow(
            Workflow::Reasoning,
            raw_bundle("q-1"),
            PipelineContext::new("tester").with_attribute("query", "who is Jane?"),
        )
        .await
        .unwrap();
    let BundlePayload::Reasoning(output) = &run.bundle.payload else {
        panic!("expected reasoning output");
    };
    assert_eq!(output.query, "who is Jane?");
    assert!(output
        .traces
        .iter()
        .any(|t| t.tier == MemoryTier::LongTerm && t.artifact_id.starts_with("entity:")));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_pipeline_and_wrong_bundle_kind_fail() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();

    let err = executor
        .run("publish", raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap_err();
    assert!(matches!(err.error, LogosError::UnknownPipeline(_)));
    assert!(err.log.stages.is_empty());

    let err = executor
        .run_workflow(Workflow::Commit, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.error,
        LogosError::StageTypeMismatch {
            expected: BundleKind::Preview,
            found: BundleKind::RawInput,
            ..
        }
    ));
    assert_eq!(err.log.status, RunStatus::Failed);
}

#[tokio::test]
async fn invalid_input_is_fatal_without_retry() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    let bundle = Bundle::new(
        InteractionMeta::new("int-1"),
        BundlePayload::RawInput(RawInput::default()),
    );

    let err = executor
        .run_workflow(Workflow::Ingest, bundle, PipelineContext::new("tester"))
        .await
        .unwrap_err();
    match err.error {
        LogosError::Stage { stage_id, attempts, .. } => {
            assert_eq!(stage_id, "ingest.validate_input");
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn store_outage_is_retried() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    let ingest = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();

    h.store.fail_next_writes(1);
    let commit = executor
        .run_workflow(Workflow::Commit, ingest.bundle, PipelineContext::new("tester"))
        .await
        .unwrap();
    let upsert = commit.log.stages.last().unwrap();
    assert_eq!(upsert.stage_id, "graph.upsert");
    assert_eq!(upsert.attempts, 2);
    assert!(h.store.node_count() > 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_become_fatal() {
    let h = harness();
    let executor = PipelineExecutor::builtin(h.services.clone(), fast_retry()).unwrap();
    let ingest = executor
        .run_workflow(Workflow::Ingest, raw_bundle("int-1"), PipelineContext::new("tester"))
        .await
        .unwrap();

    h.store.fail_next_writes(10);
    let err = executor
        .run_workflow(Workflow::Commit, ingest.bundle, PipelineContext::new("tester"))
        .await
        .unwrap_err();
    match &err.error {
        LogosError::Stage { attempts, source, .. } => {
            assert_eq!(*attempts, 3);
            assert!(!source.is_recoverable());
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.last_bundle.kind(), BundleKind::Upsert);
}

struct Stall;

#[async_trait]
impl Stage for Stall {
    fn id(&self) -> &'static str {
        "test.stall"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Resolution
    }

    fn output(&self) -> BundleKind {
        BundleKind::Resolution
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(bundle.derive(bundle.payload.clone()))
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_discards_the_runs_transient_artifacts() {
    let h = harness();
    let catalog = PipelineCatalog {
        pipelines: vec![PipelineDefinition {
            id: "slow-ingest".into(),
            workflow: Workflow::Ingest,
            stages: [
                "ingest.validate_input",
                "ingest.parse",
                "nlp.extract",
                "normalise.resolve_entities",
                "memory.tag",
                "test.stall",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }],
    };
    let registry = builtin_registry().with_stage(Arc::new(Stall));
    let executor =
        PipelineExecutor::new(h.services.clone(), registry, catalog, fast_retry()).unwrap();

    let err = executor
        .run_workflow(
            Workflow::Ingest,
            raw_bundle("int-1"),
            PipelineContext::new("tester").with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.error, LogosError::DeadlineExceeded { ref stage_id } if stage_id == "test.stall"));
    assert_eq!(err.log.status, RunStatus::DeadlineExceeded);
    assert_eq!(err.discarded.len(), 1);
    assert!(err.discarded[0].starts_with("entity:organization_"));
    // The long-term person survives the abort.
    assert_eq!(h.services.memory.len(), 1);
}
