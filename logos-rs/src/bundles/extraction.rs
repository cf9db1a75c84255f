//! Structured extraction results consumed from the extraction collaborator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a mention came from and how sure the extractor was about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default = "default_extraction_confidence")]
    pub extraction_confidence: f64,
}

fn default_extraction_confidence() -> f64 {
    0.5
}

impl Default for MentionProvenance {
    fn default() -> Self {
        Self {
            source_ref: None,
            extraction_confidence: default_extraction_confidence(),
        }
    }
}

/// An entity as it appears in one interaction, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    /// Identifier local to the extraction (e.g. `"m1"`).
    pub temp_id: String,
    /// Type tag, a key into the schema registry.
    #[serde(alias = "type")]
    pub type_key: String,
    /// Surface attributes: name, email, organization hint, ...
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: MentionProvenance,
}

impl EntityMention {
    pub fn new(temp_id: impl Into<String>, type_key: impl Into<String>) -> Self {
        Self {
            temp_id: temp_id.into(),
            type_key: type_key.into(),
            attributes: BTreeMap::new(),
            provenance: MentionProvenance::default(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Non-empty attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.attribute("name")
    }
}

/// A relationship between two mentions of the same extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedRelationship {
    /// Temp id of the source mention.
    #[serde(alias = "src")]
    pub source: String,
    /// Temp id of the target mention.
    #[serde(alias = "dst")]
    pub target: String,
    #[serde(alias = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Everything the extractor returned for one interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default, alias = "entities")]
    pub mentions: Vec<EntityMention>,
    #[serde(default)]
    pub relationships: Vec<ProposedRelationship>,
    /// Scalar metrics such as `sentiment`.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}
