//! Node model of the knowledge graph.
//!
//! Graph nodes are untyped at compile time: the label is a Schema Registry
//! key and properties are free-form JSON values. What every node and edge
//! does share is [`Provenance`].

pub mod entity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use entity::GraphNode;

/// Who created and last touched a graph element, and when.
///
/// `created_*` and `first_seen_at` are written once; later merges only move
/// the `updated_*` / `last_seen_at` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub created_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_by: String,
}

impl Provenance {
    pub fn created(actor: &str, now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            first_seen_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            last_seen_at: now,
            updated_by: actor.to_string(),
        }
    }

    pub fn touch(&mut self, actor: &str, now: DateTime<Utc>) {
        self.updated_at = now;
        self.last_seen_at = now;
        self.updated_by = actor.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn touch_keeps_creation_metadata() {
        let t0 = Utc::now();
        let mut p = Provenance::created("alice", t0);
        p.touch("bob", t0 + Duration::minutes(5));

        assert_eq!(p.created_at, t0);
        assert_eq!(p.first_seen_at, t0);
        assert_eq!(p.created_by, "alice");
        assert_eq!(p.updated_by, "bob");
        assert_eq!(p.last_seen_at, t0 + Duration::minutes(5));
    }
}
