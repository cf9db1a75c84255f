//! Boundary to the extraction capability.
//!
//! Model inference happens elsewhere; the core only sees an [`Extractor`]
//! returning structured mentions, relationships and metrics.

use async_trait::async_trait;

use crate::bundles::{ExtractionResult, InteractionMeta, ParsedContent};
use crate::errors::ExtractorError;
use crate::utils::extract_json_from_response;

/// Metadata key under which a parser may hand over a finished extraction.
pub const EXTRACTION_METADATA_KEY: &str = "extraction";

/// Turns parsed content into an extraction result.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        content: &ParsedContent,
        meta: &InteractionMeta,
    ) -> Result<ExtractionResult, ExtractorError>;
}

/// Reads an extraction that is already present as JSON.
///
/// Looks at `metadata["extraction"]` first, then at the text itself, which
/// may be a model response with the JSON inside a fenced block.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExtractor;

#[async_trait]
impl Extractor for JsonExtractor {
    async fn extract(
        &self,
        content: &ParsedContent,
        _meta: &InteractionMeta,
    ) -> Result<ExtractionResult, ExtractorError> {
        if let Some(value) = content.metadata.get(EXTRACTION_METADATA_KEY) {
            return serde_json::from_value(value.clone())
                .map_err(|e| ExtractorError::Malformed(e.to_string()));
        }
        let json = extract_json_from_response(&content.text)
            .ok_or_else(|| ExtractorError::Malformed("no JSON object in content".to_string()))?;
        serde_json::from_str(json).map_err(|e| ExtractorError::Malformed(e.to_string()))
    }
}
