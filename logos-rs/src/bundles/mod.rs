//! Versioned bundles passed between pipeline stages.
//!
//! A [`Bundle`] is never mutated by a stage. Stages read the incoming bundle
//! and return a new one created with [`Bundle::derive`], which records the
//! parent id so a run can be traced bundle by bundle.

pub mod extraction;
pub mod preview;
pub mod resolution;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::memory::{MemoryTier, SweepReport};
use crate::upsert::UpsertPayload;

pub use extraction::{EntityMention, ExtractionResult, MentionProvenance, ProposedRelationship};
pub use preview::{EntityAction, PreviewEntity, PreviewPayload};
pub use resolution::{
    reassign_identities, IdentityEvent, ResolutionLogEntry, ResolutionSet, ResolvedEntity,
    ResolvedRelationship,
};

/// Schema version of the bundle envelope.
pub const BUNDLE_VERSION: &str = "0.1";

/// Version of the processing logic that produced a bundle.
pub const PROCESSING_VERSION: &str = "0.1";

/// Discriminant of a bundle payload; stages declare their contract in these terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    RawInput,
    ParsedContent,
    Extraction,
    Resolution,
    Preview,
    Upsert,
    Consolidation,
    Reasoning,
    Feedback,
}

impl BundleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::RawInput => "raw_input",
            BundleKind::ParsedContent => "parsed_content",
            BundleKind::Extraction => "extraction",
            BundleKind::Resolution => "resolution",
            BundleKind::Preview => "preview",
            BundleKind::Upsert => "upsert",
            BundleKind::Consolidation => "consolidation",
            BundleKind::Reasoning => "reasoning",
            BundleKind::Feedback => "feedback",
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an interaction came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Doc,
    Audio,
    #[default]
    Text,
}

/// Interaction metadata carried unchanged through every bundle of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMeta {
    pub interaction_id: String,
    #[serde(default = "default_interaction_type")]
    pub interaction_type: String,
    pub interaction_at: DateTime<Utc>,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

fn default_interaction_type() -> String {
    "note".to_string()
}

impl InteractionMeta {
    /// Metadata for a new text interaction happening now.
    pub fn new(interaction_id: impl Into<String>) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            interaction_type: default_interaction_type(),
            interaction_at: Utc::now(),
            source_type: SourceType::Text,
            source_uri: None,
            created_by: None,
            project_id: None,
        }
    }
}

/// Reference to raw input: inline text and/or a file for the parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Plain text produced by parsing or transcription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedContent {
    pub text: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Request and report of a consolidation pass over the memory tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRequest {
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepReport>,
    #[serde(default)]
    pub deprecated_types: Vec<String>,
}

impl ConsolidationRequest {
    pub fn now() -> Self {
        Self {
            requested_at: Utc::now(),
            sweep: None,
            deprecated_types: Vec::new(),
        }
    }
}

/// One memory artifact recalled for a reasoning query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
    pub tier: MemoryTier,
    pub strength: f64,
    #[serde(default)]
    pub payload: Value,
}

/// Output of the reasoning workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOutput {
    pub query: String,
    #[serde(default)]
    pub traces: Vec<ReasoningTrace>,
    /// Temp ids of query entities with nothing in memory.
    #[serde(default)]
    pub unknown_mentions: Vec<String>,
}

/// User feedback on a processed interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub corrections: BTreeMap<String, Value>,
}

/// Tagged payload of a bundle. Exactly one variant per [`BundleKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BundlePayload {
    RawInput(RawInput),
    ParsedContent(ParsedContent),
    Extraction(ExtractionResult),
    Resolution(ResolutionSet),
    Preview(PreviewPayload),
    Upsert(UpsertPayload),
    Consolidation(ConsolidationRequest),
    Reasoning(ReasoningOutput),
    Feedback(Feedback),
}

impl BundlePayload {
    pub fn kind(&self) -> BundleKind {
        match self {
            BundlePayload::RawInput(_) => BundleKind::RawInput,
            BundlePayload::ParsedContent(_) => BundleKind::ParsedContent,
            BundlePayload::Extraction(_) => BundleKind::Extraction,
            BundlePayload::Resolution(_) => BundleKind::Resolution,
            BundlePayload::Preview(_) => BundleKind::Preview,
            BundlePayload::Upsert(_) => BundleKind::Upsert,
            BundlePayload::Consolidation(_) => BundleKind::Consolidation,
            BundlePayload::Reasoning(_) => BundleKind::Reasoning,
            BundlePayload::Feedback(_) => BundleKind::Feedback,
        }
    }
}

/// Immutable, versioned container owned by a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub bundle_version: String,
    pub processing_version: String,
    pub meta: InteractionMeta,
    pub payload: BundlePayload,
}

impl Bundle {
    /// Create a root bundle (no parent).
    pub fn new(meta: InteractionMeta, payload: BundlePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            bundle_version: BUNDLE_VERSION.to_string(),
            processing_version: PROCESSING_VERSION.to_string(),
            meta,
            payload,
        }
    }

    /// Create the successor of `self` carrying `payload`.
    ///
    /// Metadata and versions are copied; `self` is left untouched.
    pub fn derive(&self, payload: BundlePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            bundle_version: self.bundle_version.clone(),
            processing_version: self.processing_version.clone(),
            meta: self.meta.clone(),
            payload,
        }
    }

    pub fn kind(&self) -> BundleKind {
        self.payload.kind()
    }
}
