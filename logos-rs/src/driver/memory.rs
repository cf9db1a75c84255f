//! In-process graph store.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{EdgeWrite, GraphStore, MergeOutcome, NodeWrite};
use crate::edges::GraphEdge;
use crate::errors::StoreError;
use crate::nodes::{GraphNode, Provenance};

/// Graph store held in memory.
///
/// Per-id writes serialize on the map shard; an `expected_version` that
/// does not match the stored one is reported, never overwritten. An update
/// replaces the stored property set.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    nodes: DashMap<String, GraphNode>,
    edges: DashMap<String, GraphEdge>,
    failing_writes: AtomicU32,
}

/// Serializable copy of the whole store, sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let store = Self::new();
        for node in snapshot.nodes {
            store.nodes.insert(node.id.clone(), node);
        }
        for edge in snapshot.edges {
            store.edges.insert(edge.id.clone(), edge);
        }
        store
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<GraphNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        let mut edges: Vec<GraphEdge> = self.edges.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        GraphSnapshot { nodes, edges }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Make the next `n` merges fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("simulated outage".to_string())),
            Err(_) => Ok(()),
        }
    }
}

fn check_version(id: &str, expected: Option<u64>, found: u64) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != found => Err(StoreError::Conflict {
            id: id.to_string(),
            expected,
            found,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>, StoreError> {
        Ok(self.nodes.get(id).map(|n| n.value().clone()))
    }

    async fn get_edge(&self, id: &str) -> Result<Option<GraphEdge>, StoreError> {
        Ok(self.edges.get(id).map(|e| e.value().clone()))
    }

    async fn merge_node(&self, write: NodeWrite) -> Result<MergeOutcome, StoreError> {
        self.check_available()?;
        match self.nodes.entry(write.id.clone()) {
            Entry::Vacant(slot) => {
                check_version(&write.id, write.expected_version, 0)?;
                slot.insert(GraphNode::new(
                    write.id,
                    write.label,
                    write.properties,
                    &write.actor,
                    write.at,
                ));
                Ok(MergeOutcome::Created)
            }
            Entry::Occupied(mut slot) => {
                let node = slot.get_mut();
                check_version(&write.id, write.expected_version, node.version)?;

                node.provenance.touch(&write.actor, write.at);
                if write.properties == node.properties && node.label == write.label {
                    return Ok(MergeOutcome::Unchanged);
                }
                node.properties = write.properties;
                node.label = write.label;
                node.version += 1;
                Ok(MergeOutcome::Updated)
            }
        }
    }

    async fn merge_edge(&self, write: EdgeWrite) -> Result<MergeOutcome, StoreError> {
        self.check_available()?;
        for endpoint in [&write.source_id, &write.target_id] {
            if !self.nodes.contains_key(endpoint.as_str()) {
                return Err(StoreError::NodeNotFound(endpoint.clone()));
            }
        }

        match self.edges.entry(write.id.clone()) {
            Entry::Vacant(slot) => {
                check_version(&write.id, write.expected_version, 0)?;
                slot.insert(GraphEdge {
                    id: write.id,
                    rel_type: write.rel_type,
                    source_id: write.source_id,
                    target_id: write.target_id,
                    properties: write.properties,
                    provenance: Provenance::created(&write.actor, write.at),
                    version: 1,
                });
                Ok(MergeOutcome::Created)
            }
            Entry::Occupied(mut slot) => {
                let edge = slot.get_mut();
                check_version(&write.id, write.expected_version, edge.version)?;

                edge.provenance.touch(&write.actor, write.at);
                let same_shape = edge.rel_type == write.rel_type
                    && edge.source_id == write.source_id
                    && edge.target_id == write.target_id;
                if write.properties == edge.properties && same_shape {
                    return Ok(MergeOutcome::Unchanged);
                }
                edge.properties = write.properties;
                edge.rel_type = write.rel_type;
                edge.source_id = write.source_id;
                edge.target_id = write.target_id;
                edge.version += 1;
                Ok(MergeOutcome::Updated)
            }
        }
    }

    async fn nodes_of_type(&self, label: &str) -> Result<Vec<GraphNode>, StoreError> {
        let mut nodes: Vec<GraphNode> = self
            .nodes
            .iter()
            .filter(|n| n.label.eq_ignore_ascii_case(label))
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}
