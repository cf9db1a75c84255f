//! Resolution results and identity bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::extraction::MentionProvenance;
use super::preview::EntityAction;
use crate::memory::TierMarker;
use crate::resolver::ResolutionDecision;

/// One change of an entity's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEvent {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A mention after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub temp_id: String,
    /// Normalised node label.
    pub type_key: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: MentionProvenance,
    pub decision: ResolutionDecision,
    /// Canonical id when matched, otherwise a deterministic minted id.
    pub stable_id: String,
    /// Key of the memory artifact tracking this entity.
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<EntityAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<TierMarker>,
    #[serde(default)]
    pub identity_history: Vec<IdentityEvent>,
}

impl ResolvedEntity {
    pub fn is_new(&self) -> bool {
        self.decision.is_new()
    }

    /// A person created, kept or linked this entity in a preview.
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.action,
            Some(EntityAction::Create | EntityAction::Keep | EntityAction::Link)
        )
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes
            .get("name")
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
    }

    fn reassign(&mut self, to: &str, reason: &str, at: DateTime<Utc>) {
        self.identity_history.push(IdentityEvent {
            from: self.stable_id.clone(),
            to: to.to_string(),
            reason: reason.to_string(),
            at,
        });
        self.stable_id = to.to_string();
    }
}

/// A relationship between two resolved entities, addressed by temp id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRelationship {
    pub source: String,
    pub target: String,
    pub rel_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ResolvedRelationship {
    pub fn touches(&self, temp_id: &str) -> bool {
        self.source == temp_id || self.target == temp_id
    }
}

/// Audit record of a decision that was not a clean automatic match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    pub temp_id: String,
    pub type_key: String,
    pub outcome: String,
    pub confidence: f64,
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Payload of a resolution bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSet {
    pub entities: Vec<ResolvedEntity>,
    #[serde(default)]
    pub relationships: Vec<ResolvedRelationship>,
    #[serde(default)]
    pub log: Vec<ResolutionLogEntry>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ResolutionSet {
    pub fn entity(&self, temp_id: &str) -> Option<&ResolvedEntity> {
        self.entities.iter().find(|e| e.temp_id == temp_id)
    }

    pub fn entity_mut(&mut self, temp_id: &str) -> Option<&mut ResolvedEntity> {
        self.entities.iter_mut().find(|e| e.temp_id == temp_id)
    }

    /// Drop an entity and every relationship touching it.
    pub fn remove_entity(&mut self, temp_id: &str) -> Option<ResolvedEntity> {
        let pos = self.entities.iter().position(|e| e.temp_id == temp_id)?;
        self.relationships.retain(|r| !r.touches(temp_id));
        Some(self.entities.remove(pos))
    }
}

/// Apply delayed identity decisions to a resolution set.
///
/// Keys of `id_map` are temp ids or stable ids. A value naming another
/// entity's temp id merges the two mentions: the mapped entity is removed,
/// relationships are rewritten onto the survivor, and self-loops created by
/// the merge are dropped. Any other value is taken as a canonical id and
/// becomes the entity's stable id. Every change lands in the affected
/// entity's identity history.
pub fn reassign_identities(
    set: &ResolutionSet,
    id_map: &BTreeMap<String, String>,
    reason: &str,
    at: DateTime<Utc>,
) -> ResolutionSet {
    let mut next = set.clone();
    let temp_ids: BTreeSet<String> = next.entities.iter().map(|e| e.temp_id.clone()).collect();
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    for entity in next.entities.iter_mut() {
        let Some(target) = id_map
            .get(&entity.temp_id)
            .or_else(|| id_map.get(&entity.stable_id))
        else {
            continue;
        };
        if *target == entity.temp_id || *target == entity.stable_id {
            continue;
        }
        if temp_ids.contains(target) {
            merged.insert(entity.temp_id.clone(), target.clone());
        } else {
            entity.reassign(target, reason, at);
            entity.decision = ResolutionDecision::confirmed(target.clone());
        }
    }

    if merged.is_empty() {
        return next;
    }

    let survivor_of = |temp_id: &str| -> String {
        let mut current = temp_id.to_string();
        for _ in 0..=merged.len() {
            match merged.get(&current) {
                Some(next_id) if *next_id != current => current = next_id.clone(),
                _ => break,
            }
        }
        current
    };

    let resolved: BTreeMap<String, String> = merged
        .keys()
        .map(|from| (from.clone(), survivor_of(from)))
        .filter(|(from, to)| from != to && !merged.contains_key(to))
        .collect();

    let merged_stable: BTreeMap<String, String> = next
        .entities
        .iter()
        .filter(|e| resolved.contains_key(&e.temp_id))
        .map(|e| (e.temp_id.clone(), e.stable_id.clone()))
        .collect();

    for (from, to) in &resolved {
        if let Some(survivor) = next.entities.iter_mut().find(|e| &e.temp_id == to) {
            let from_stable = merged_stable.get(from).cloned().unwrap_or_else(|| from.clone());
            survivor.identity_history.push(IdentityEvent {
                from: from_stable,
                to: survivor.stable_id.clone(),
                reason: reason.to_string(),
                at,
            });
        }
    }

    next.entities.retain(|e| !resolved.contains_key(&e.temp_id));
    for rel in next.relationships.iter_mut() {
        if let Some(to) = resolved.get(&rel.source) {
            rel.source = to.clone();
        }
        if let Some(to) = resolved.get(&rel.target) {
            rel.target = to.clone();
        }
    }
    next.relationships.retain(|r| r.source != r.target);

    next
}
