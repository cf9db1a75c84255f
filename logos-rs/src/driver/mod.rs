//! Graph store abstraction.
//!
//! Defines the [`GraphStore`] trait the upsert engine writes through: a
//! transactional merge-by-identity store with optimistic version checks.
//! [`memory::InMemoryGraphStore`] is the bundled backend.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::edges::GraphEdge;
use crate::errors::StoreError;
use crate::nodes::GraphNode;
use crate::resolver::index::{CandidateIndex, CandidateProvider, CanonicalEntity, SurfaceHints};

pub use memory::{GraphSnapshot, InMemoryGraphStore};

/// What a merge did to the stored element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    /// Properties changed; version bumped.
    Updated,
    /// Identical properties; only `last_seen_at` / `updated_*` moved.
    Unchanged,
}

/// A create-or-update of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeWrite {
    pub id: String,
    pub label: String,
    pub properties: BTreeMap<String, Value>,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Version the writer last observed; `Some(0)` means "must not exist".
    /// A mismatch is reported as [`StoreError::Conflict`].
    pub expected_version: Option<u64>,
}

/// A create-or-update of one relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeWrite {
    pub id: String,
    pub rel_type: String,
    pub source_id: String,
    pub target_id: String,
    pub properties: BTreeMap<String, Value>,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub expected_version: Option<u64>,
}

/// Trait representing a graph database backend.
///
/// Concurrent merges on the same id must serialize inside the store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Health check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>, StoreError>;

    async fn get_edge(&self, id: &str) -> Result<Option<GraphEdge>, StoreError>;

    /// Merge by id. The written properties replace the stored set; creation
    /// provenance is kept.
    async fn merge_node(&self, write: NodeWrite) -> Result<MergeOutcome, StoreError>;

    /// Merge by id. Both endpoints must already exist.
    async fn merge_edge(&self, write: EdgeWrite) -> Result<MergeOutcome, StoreError>;

    async fn nodes_of_type(&self, label: &str) -> Result<Vec<GraphNode>, StoreError>;
}

/// Candidate provider backed by the nodes already in a [`GraphStore`].
///
/// String properties become candidate attributes.
#[derive(Clone)]
pub struct GraphCandidateProvider {
    store: Arc<dyn GraphStore>,
}

impl GraphCandidateProvider {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CandidateProvider for GraphCandidateProvider {
    async fn candidates(
        &self,
        type_key: &str,
        _hints: &SurfaceHints,
    ) -> Result<CandidateIndex, StoreError> {
        let nodes = self.store.nodes_of_type(type_key).await?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let mut entity = CanonicalEntity::new(node.id, node.label);
                for (key, value) in node.properties {
                    if let Value::String(s) = value {
                        entity.attributes.insert(key, s);
                    }
                }
                entity
            })
            .collect())
    }
}
