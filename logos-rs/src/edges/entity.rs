//! GraphEdge — a typed relationship between two materialized nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nodes::Provenance;

/// A relationship stored in the graph.
///
/// Endpoints are stable node ids; an edge is never written unless both
/// endpoints exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Stable identifier, usually derived from type and endpoints.
    pub id: String,
    /// Relationship type key (e.g. "WORKS_FOR").
    pub rel_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub provenance: Provenance,
    pub version: u64,
}

impl GraphEdge {
    /// Deterministic edge id for a typed relationship between two nodes.
    pub fn derive_id(rel_type: &str, source_id: &str, target_id: &str) -> String {
        format!("{}:{source_id}->{target_id}", rel_type.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_directional() {
        let ab = GraphEdge::derive_id("WORKS_FOR", "p_1", "c_001");
        let ba = GraphEdge::derive_id("WORKS_FOR", "c_001", "p_1");
        assert_eq!(ab, "works_for:p_1->c_001");
        assert_ne!(ab, ba);
    }
}
