//! Candidate snapshots handed to the resolver.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// An entity already known to the knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: String,
    pub type_key: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CanonicalEntity {
    pub fn new(id: impl Into<String>, type_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_key: type_key.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Read-only snapshot of canonical entities.
///
/// Cloning is cheap; the entities are shared.
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    entities: Arc<[CanonicalEntity]>,
}

impl CandidateIndex {
    pub fn new(entities: Vec<CanonicalEntity>) -> Self {
        Self {
            entities: entities.into(),
        }
    }

    pub fn entities(&self) -> &[CanonicalEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl FromIterator<CanonicalEntity> for CandidateIndex {
    fn from_iter<I: IntoIterator<Item = CanonicalEntity>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Surface hints a provider may use to narrow its snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceHints {
    pub name: Option<String>,
    pub keys: BTreeMap<String, String>,
}

/// Supplies candidate snapshots for a type key.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn candidates(
        &self,
        type_key: &str,
        hints: &SurfaceHints,
    ) -> Result<CandidateIndex, StoreError>;
}

/// Provider over a fixed list of entities.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateProvider {
    entities: Vec<CanonicalEntity>,
}

impl StaticCandidateProvider {
    pub fn new(entities: Vec<CanonicalEntity>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl CandidateProvider for StaticCandidateProvider {
    async fn candidates(
        &self,
        type_key: &str,
        _hints: &SurfaceHints,
    ) -> Result<CandidateIndex, StoreError> {
        Ok(self
            .entities
            .iter()
            .filter(|e| e.type_key.eq_ignore_ascii_case(type_key))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_filters_by_type_case_insensitively() {
        let provider = StaticCandidateProvider::new(vec![
            CanonicalEntity::new("p_1", "Person"),
            CanonicalEntity::new("c_1", "Organization"),
        ]);
        let index = provider
            .candidates("person", &SurfaceHints::default())
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.entities()[0].id, "p_1");
    }
}
