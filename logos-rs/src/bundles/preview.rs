//! Preview of a resolution for human review, and the annotations sent back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resolution::{ResolutionSet, ResolvedRelationship};
use crate::errors::StageError;
use crate::memory::MemoryTier;
use crate::resolver::{mint_stable_id, ResolutionDecision, ScoredCandidate};

/// What a reviewer decided for one previewed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    /// Persist as a new entity.
    Create,
    /// Keep the proposed canonical match.
    Keep,
    /// Link to the canonical id given in the annotation.
    Link,
    /// Drop the entity and its relationships.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewEntity {
    pub temp_id: String,
    pub type_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
    pub confidence: f64,
    pub is_new: bool,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub candidates: Vec<ScoredCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<MemoryTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<EntityAction>,
}

/// Payload of a preview bundle.
///
/// The full resolution is carried along so the commit workflow can rebuild
/// it from an annotated preview without re-running resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewPayload {
    pub entities: Vec<PreviewEntity>,
    #[serde(default)]
    pub relationships: Vec<ResolvedRelationship>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub resolution: ResolutionSet,
}

impl PreviewPayload {
    pub fn from_resolution(set: &ResolutionSet) -> Self {
        let entities = set
            .entities
            .iter()
            .map(|e| {
                let candidates = match &e.decision {
                    ResolutionDecision::Ambiguous { candidates, .. } => candidates.clone(),
                    _ => Vec::new(),
                };
                PreviewEntity {
                    temp_id: e.temp_id.clone(),
                    type_key: e.type_key.clone(),
                    name: e.name().map(str::to_string),
                    canonical_id: e.decision.canonical_id().map(str::to_string),
                    confidence: e.decision.confidence(),
                    is_new: e.is_new(),
                    needs_review: e.decision.requires_review(),
                    candidates,
                    tier: e.marker.as_ref().map(|m| m.tier),
                    action: e.action,
                }
            })
            .collect();

        Self {
            entities,
            relationships: set.relationships.clone(),
            metrics: set.metrics.clone(),
            summary: set.summary.clone(),
            resolution: set.clone(),
        }
    }

    /// Record a reviewer action. Returns `false` if `temp_id` is unknown.
    pub fn annotate(
        &mut self,
        temp_id: &str,
        action: EntityAction,
        canonical_id: Option<String>,
    ) -> bool {
        let Some(entity) = self.entities.iter_mut().find(|e| e.temp_id == temp_id) else {
            return false;
        };
        entity.action = Some(action);
        if canonical_id.is_some() {
            entity.canonical_id = canonical_id;
        }
        true
    }

    /// Fold reviewer annotations back into the carried resolution.
    ///
    /// `ignore` removes the entity and every relationship touching it.
    /// `keep`/`link` require a canonical id and count as confirmation.
    /// `create` turns the entity into a new one with a minted stable id.
    /// Entities without an action are passed through unchanged.
    pub fn apply_annotations(&self, at: DateTime<Utc>) -> Result<ResolutionSet, StageError> {
        let mut set = self.resolution.clone();

        for preview in &self.entities {
            let Some(action) = preview.action else {
                continue;
            };
            if action == EntityAction::Ignore {
                if set.remove_entity(&preview.temp_id).is_none() {
                    return Err(unknown_entity(&preview.temp_id));
                }
                continue;
            }

            let entity = set
                .entity_mut(&preview.temp_id)
                .ok_or_else(|| unknown_entity(&preview.temp_id))?;

            match action {
                EntityAction::Keep | EntityAction::Link => {
                    let canonical = preview
                        .canonical_id
                        .clone()
                        .or_else(|| entity.decision.canonical_id().map(str::to_string))
                        .ok_or_else(|| {
                            StageError::Fatal(format!(
                                "entity '{}' is marked {:?} but has no canonical id",
                                preview.temp_id, action
                            ))
                        })?;
                    if canonical != entity.stable_id {
                        entity.identity_history.push(super::IdentityEvent {
                            from: entity.stable_id.clone(),
                            to: canonical.clone(),
                            reason: "linked in preview".to_string(),
                            at,
                        });
                        entity.stable_id = canonical.clone();
                    }
                    entity.decision = ResolutionDecision::confirmed(canonical);
                }
                EntityAction::Create => {
                    if !entity.is_new() {
                        let minted =
                            mint_stable_id(&entity.type_key, &entity.attributes, &entity.temp_id);
                        entity.identity_history.push(super::IdentityEvent {
                            from: entity.stable_id.clone(),
                            to: minted.clone(),
                            reason: "created in preview".to_string(),
                            at,
                        });
                        entity.stable_id = minted;
                        entity.decision = ResolutionDecision::New;
                    }
                }
                EntityAction::Ignore => {}
            }
            entity.artifact_id = format!("entity:{}", entity.stable_id);
            entity.action = Some(action);
        }

        Ok(set)
    }
}

fn unknown_entity(temp_id: &str) -> StageError {
    StageError::Fatal(format!("annotation refers to unknown entity '{temp_id}'"))
}
