//! GraphNode — a persisted, canonical graph element.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Provenance;

/// A node stored in the graph, identified by a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Stable identifier (e.g. `person_3f2a…`).
    pub id: String,
    /// Schema Registry node type key.
    pub label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub provenance: Provenance,
    /// Bumped on every property change; starts at 1.
    pub version: u64,
}

impl GraphNode {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        properties: BTreeMap<String, Value>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            properties,
            provenance: Provenance::created(actor, now),
            version: 1,
        }
    }

    /// String-valued property, if present.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_graph_node_serde_roundtrip() {
        let now = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), json!("Acme Pty Ltd"));
        props.insert("employees".to_string(), json!(500));
        let node = GraphNode::new("c_001", "Company", props, "ingest", now);

        let raw = serde_json::to_string(&node).unwrap();
        let back: GraphNode = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.text("name"), Some("Acme Pty Ltd"));
        assert_eq!(back.text("employees"), None);
        assert_eq!(back.version, 1);
    }
}
