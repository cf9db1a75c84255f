//! Graph upsert engine.
//!
//! Turns long-term artifacts into idempotent create-or-update writes against a
//! [`GraphStore`], validating every operation's type against the
//! [`SchemaRegistry`] first.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::driver::{EdgeWrite, GraphStore, MergeOutcome, NodeWrite};
use crate::edges::GraphEdge;
use crate::errors::{SchemaError, UpsertError};
use crate::memory::MemoryTier;
use crate::schema::{normalize_type_key, DeprecationPolicy, SchemaRegistry, TypeKind};

fn long_term() -> MemoryTier {
    MemoryTier::LongTerm
}

/// One write in an upsert batch. Ids are stable, never temporary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpsertOperation {
    Node {
        type_key: String,
        id: String,
        #[serde(default)]
        properties: BTreeMap<String, Value>,
        #[serde(default = "long_term")]
        tier: MemoryTier,
    },
    Relationship {
        type_key: String,
        id: String,
        source_id: String,
        target_id: String,
        #[serde(default)]
        properties: BTreeMap<String, Value>,
        #[serde(default = "long_term")]
        tier: MemoryTier,
    },
}

impl UpsertOperation {
    pub fn node(
        type_key: impl Into<String>,
        id: impl Into<String>,
        properties: BTreeMap<String, Value>,
    ) -> Self {
        UpsertOperation::Node {
            type_key: type_key.into(),
            id: id.into(),
            properties,
            tier: MemoryTier::LongTerm,
        }
    }

    /// Relationship with an id derived from its type and endpoints.
    pub fn relationship(
        type_key: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        properties: BTreeMap<String, Value>,
    ) -> Self {
        let type_key = type_key.into();
        let source_id = source_id.into();
        let target_id = target_id.into();
        UpsertOperation::Relationship {
            id: GraphEdge::derive_id(&type_key, &source_id, &target_id),
            type_key,
            source_id,
            target_id,
            properties,
            tier: MemoryTier::LongTerm,
        }
    }

    pub fn with_tier(mut self, new_tier: MemoryTier) -> Self {
        match &mut self {
            UpsertOperation::Node { tier, .. } | UpsertOperation::Relationship { tier, .. } => {
                *tier = new_tier
            }
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            UpsertOperation::Node { id, .. } | UpsertOperation::Relationship { id, .. } => id,
        }
    }

    pub fn type_key(&self) -> &str {
        match self {
            UpsertOperation::Node { type_key, .. }
            | UpsertOperation::Relationship { type_key, .. } => type_key,
        }
    }

    pub fn tier(&self) -> MemoryTier {
        match self {
            UpsertOperation::Node { tier, .. } | UpsertOperation::Relationship { tier, .. } => {
                *tier
            }
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            UpsertOperation::Node { .. } => TypeKind::Node,
            UpsertOperation::Relationship { .. } => TypeKind::Relationship,
        }
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        match self {
            UpsertOperation::Node { properties, .. }
            | UpsertOperation::Relationship { properties, .. } => properties,
        }
    }
}

/// How an applied operation changed the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Unchanged,
}

impl From<MergeOutcome> for ChangeKind {
    fn from(outcome: MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Created => ChangeKind::Created,
            MergeOutcome::Updated => ChangeKind::Updated,
            MergeOutcome::Unchanged => ChangeKind::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    /// Position in the submitted batch.
    pub index: usize,
    pub id: String,
    pub type_key: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub index: usize,
    pub id: String,
    pub error: UpsertError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every operation applied.
    Complete,
    /// Some applied, some failed. Nothing is rolled back.
    Partial,
    /// Nothing applied.
    Rejected,
}

/// Per-operation outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub status: BatchStatus,
    #[serde(default)]
    pub applied: Vec<AppliedOperation>,
    #[serde(default)]
    pub failed: Vec<FailedOperation>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub schema_version: u64,
}

impl UpsertResult {
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }

    pub fn count(&self, change: ChangeKind) -> usize {
        self.applied.iter().filter(|a| a.change == change).count()
    }
}

impl fmt::Display for UpsertResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied ({} created, {} updated, {} unchanged), {} failed",
            self.applied.len(),
            self.count(ChangeKind::Created),
            self.count(ChangeKind::Updated),
            self.count(ChangeKind::Unchanged),
            self.failed.len()
        )
    }
}

/// Payload of an upsert bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertPayload {
    pub operations: Vec<UpsertOperation>,
    /// Artifacts left out because they are not long-term yet.
    #[serde(default)]
    pub deferred: Vec<String>,
    /// Filled in once the batch has been applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UpsertResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertConfig {
    /// Register unknown types on write instead of rejecting them.
    #[serde(default)]
    pub allow_schema_growth: bool,
}

/// Applies upsert batches.
pub struct UpsertEngine {
    schema: Arc<SchemaRegistry>,
    store: Arc<dyn GraphStore>,
    config: UpsertConfig,
}

impl UpsertEngine {
    pub fn new(schema: Arc<SchemaRegistry>, store: Arc<dyn GraphStore>, config: UpsertConfig) -> Self {
        Self {
            schema,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub async fn apply(&self, operations: &[UpsertOperation], actor: &str) -> UpsertResult {
        self.apply_at(operations, actor, Utc::now()).await
    }

    /// Apply a batch.
    ///
    /// Operations are validated individually, then the batch is checked for
    /// relationship endpoints that would not exist; one dangling endpoint
    /// rejects the whole batch. Valid operations are written in order and
    /// the first store failure stops the batch. Nothing applied is undone.
    pub async fn apply_at(
        &self,
        operations: &[UpsertOperation],
        actor: &str,
        now: DateTime<Utc>,
    ) -> UpsertResult {
        let mut failed = Vec::new();
        let mut warnings = Vec::new();

        // (index, normalised type key)
        let mut valid: Vec<(usize, String)> = Vec::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            match self.validate(op) {
                Ok(key) => valid.push((index, key)),
                Err(error) => failed.push(FailedOperation {
                    index,
                    id: op.id().to_string(),
                    error,
                }),
            }
        }

        let dangling = self.dangling_references(operations, &valid).await;
        if !dangling.is_empty() {
            let offenders: HashSet<usize> = dangling.iter().map(|(i, _)| *i).collect();
            for (index, endpoint) in dangling {
                failed.push(FailedOperation {
                    index,
                    id: operations[index].id().to_string(),
                    error: UpsertError::DanglingReference { endpoint },
                });
            }
            for (index, _) in valid.iter().filter(|(i, _)| !offenders.contains(i)) {
                failed.push(FailedOperation {
                    index: *index,
                    id: operations[*index].id().to_string(),
                    error: UpsertError::NotAttempted {
                        reason: "batch rejected: dangling relationship endpoint".to_string(),
                    },
                });
            }
            failed.sort_by_key(|f| f.index);
            warn!(failed = failed.len(), "upsert batch rejected");
            return self.finish(Vec::new(), failed, warnings);
        }

        let mut applied = Vec::with_capacity(valid.len());
        let mut pending = valid.into_iter();
        while let Some((index, type_key)) = pending.next() {
            let op = &operations[index];
            match self.write(op, &type_key, actor, now).await {
                Ok(change) => {
                    match self.schema.register_or_touch_at(
                        op.kind(),
                        &type_key,
                        op.properties().keys().cloned(),
                        now,
                    ) {
                        Ok(touch) => {
                            if let Some(w) = touch.warning {
                                warnings.push(format!("{}: {w}", op.id()));
                            }
                        }
                        Err(e) => warnings.push(format!("{}: schema usage not recorded: {e}", op.id())),
                    }
                    applied.push(AppliedOperation {
                        index,
                        id: op.id().to_string(),
                        type_key,
                        change,
                    });
                }
                Err(error) => {
                    warn!(op_id = op.id(), error = %error, "upsert operation failed");
                    failed.push(FailedOperation {
                        index,
                        id: op.id().to_string(),
                        error,
                    });
                    for (rest, _) in pending.by_ref() {
                        failed.push(FailedOperation {
                            index: rest,
                            id: operations[rest].id().to_string(),
                            error: UpsertError::NotAttempted {
                                reason: format!("stopped after failure of '{}'", op.id()),
                            },
                        });
                    }
                }
            }
        }

        failed.sort_by_key(|f| f.index);
        self.finish(applied, failed, warnings)
    }

    fn finish(
        &self,
        applied: Vec<AppliedOperation>,
        failed: Vec<FailedOperation>,
        warnings: Vec<String>,
    ) -> UpsertResult {
        let status = match (applied.is_empty(), failed.is_empty()) {
            (_, true) => BatchStatus::Complete,
            (true, false) => BatchStatus::Rejected,
            (false, false) => BatchStatus::Partial,
        };
        let result = UpsertResult {
            status,
            applied,
            failed,
            warnings,
            schema_version: self.schema.version(),
        };
        info!(status = ?result.status, schema_version = result.schema_version, "{result}");
        result
    }

    /// Per-operation checks; returns the normalised type key.
    fn validate(&self, op: &UpsertOperation) -> Result<String, UpsertError> {
        if op.tier() != MemoryTier::LongTerm {
            return Err(UpsertError::NotLongTerm { tier: op.tier() });
        }
        let unknown = || UpsertError::UnknownType {
            type_key: op.type_key().to_string(),
        };

        let key = normalize_type_key(op.kind(), op.type_key()).map_err(|_| unknown())?;
        match self.schema.resolve_kind(op.kind(), &key) {
            Ok(def) if def.deprecated && self.schema.policy() == DeprecationPolicy::Block => {
                Err(UpsertError::DeprecatedTypeWrite {
                    type_key: key,
                    reason: def.deprecation_reason.unwrap_or_default(),
                })
            }
            Ok(_) => Ok(key),
            Err(SchemaError::UnknownType(_)) if self.config.allow_schema_growth => Ok(key),
            Err(_) => Err(unknown()),
        }
    }

    /// Relationship endpoints that neither precede the relationship as a
    /// valid node operation nor exist in the store.
    async fn dangling_references(
        &self,
        operations: &[UpsertOperation],
        valid: &[(usize, String)],
    ) -> Vec<(usize, String)> {
        let mut dangling = Vec::new();
        let mut materialized: HashSet<&str> = HashSet::new();
        for (index, _) in valid {
            match &operations[*index] {
                UpsertOperation::Node { id, .. } => {
                    materialized.insert(id);
                }
                UpsertOperation::Relationship {
                    source_id,
                    target_id,
                    ..
                } => {
                    for endpoint in [source_id, target_id] {
                        if materialized.contains(endpoint.as_str()) {
                            continue;
                        }
                        let exists = matches!(self.store.get_node(endpoint).await, Ok(Some(_)));
                        if !exists {
                            dangling.push((*index, endpoint.clone()));
                            break;
                        }
                    }
                }
            }
        }
        dangling
    }

    /// Read the current version, then merge conditioned on it so that a
    /// concurrent writer shows up as a conflict.
    async fn write(
        &self,
        op: &UpsertOperation,
        type_key: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ChangeKind, UpsertError> {
        let outcome = match op {
            UpsertOperation::Node { id, properties, .. } => {
                let seen = self.store.get_node(id).await?.map_or(0, |n| n.version);
                self.store
                    .merge_node(NodeWrite {
                        id: id.clone(),
                        label: type_key.to_string(),
                        properties: properties.clone(),
                        actor: actor.to_string(),
                        at: now,
                        expected_version: Some(seen),
                    })
                    .await?
            }
            UpsertOperation::Relationship {
                id,
                source_id,
                target_id,
                properties,
                ..
            } => {
                let seen = self.store.get_edge(id).await?.map_or(0, |e| e.version);
                self.store
                    .merge_edge(EdgeWrite {
                        id: id.clone(),
                        rel_type: type_key.to_string(),
                        source_id: source_id.clone(),
                        target_id: target_id.clone(),
                        properties: properties.clone(),
                        actor: actor.to_string(),
                        at: now,
                        expected_version: Some(seen),
                    })
                    .await?
            }
        };
        Ok(outcome.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InMemoryGraphStore;
    use crate::schema::MemorySchemaStore;
    use serde_json::json;

    fn engine(growth: bool) -> (UpsertEngine, Arc<InMemoryGraphStore>) {
        let schema = Arc::new(
            SchemaRegistry::load(MemorySchemaStore::default(), DeprecationPolicy::Warn).unwrap(),
        );
        let store = Arc::new(InMemoryGraphStore::new());
        let engine = UpsertEngine::new(
            schema,
            store.clone(),
            UpsertConfig {
                allow_schema_growth: growth,
            },
        );
        (engine, store)
    }

    fn company(name: &str) -> UpsertOperation {
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), json!(name));
        UpsertOperation::node("Company", "c_001", props)
    }

    #[tokio::test]
    async fn unknown_type_without_growth_fails_only_that_operation() {
        let (engine, store) = engine(false);
        engine
            .schema()
            .register_or_touch(TypeKind::Node, "Person", ["name"])
            .unwrap();

        let ops = vec![
            UpsertOperation::node("Person", "p_1", BTreeMap::new()),
            UpsertOperation::node("Gadget", "g_1", BTreeMap::new()),
        ];
        let result = engine.apply(&ops, "test").await;

        assert_eq!(result.status, BatchStatus::Partial);
        assert_eq!(result.applied.len(), 1);
        assert_eq!(
            result.failed[0].error,
            UpsertError::UnknownType {
                type_key: "Gadget".into()
            }
        );
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn schema_growth_registers_on_write() {
        let (engine, _) = engine(true);
        let result = engine.apply(&[company("Acme")], "test").await;
        assert!(result.is_complete());
        let def = engine.schema().resolve("Company").unwrap();
        assert_eq!(def.usage_count, 1);
        assert!(def.properties.contains("name"));
    }

    #[tokio::test]
    async fn non_long_term_operations_are_refused() {
        let (engine, store) = engine(true);
        let op = company("Acme").with_tier(MemoryTier::MidTerm);
        let result = engine.apply(&[op], "test").await;
        assert_eq!(result.status, BatchStatus::Rejected);
        assert_eq!(
            result.failed[0].error,
            UpsertError::NotLongTerm {
                tier: MemoryTier::MidTerm
            }
        );
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn reapplying_reports_unchanged() {
        let (engine, _) = engine(true);
        let ops = vec![company("Acme")];
        let first = engine.apply(&ops, "test").await;
        let second = engine.apply(&ops, "test").await;
        assert_eq!(first.applied[0].change, ChangeKind::Created);
        assert_eq!(second.applied[0].change, ChangeKind::Unchanged);
        assert_eq!(second.to_string(), "1 applied (0 created, 0 updated, 1 unchanged), 0 failed");
    }

    #[test]
    fn operations_deserialize_with_long_term_default() {
        let op: UpsertOperation = serde_json::from_value(json!({
            "op": "relationship",
            "type_key": "WORKS_FOR",
            "id": "works_for:p_1->c_001",
            "source_id": "p_1",
            "target_id": "c_001"
        }))
        .unwrap();
        assert_eq!(op.tier(), MemoryTier::LongTerm);
        assert_eq!(op.kind(), TypeKind::Relationship);
    }
}
