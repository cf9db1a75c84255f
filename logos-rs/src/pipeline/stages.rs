//! Built-in stages of the ingest, commit, consolidation and reasoning
//! workflows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::registry::StageRegistry;
use super::stage::{Stage, StageContext};
use crate::bundles::{
    reassign_identities, Bundle, BundleKind, BundlePayload, EntityMention, InteractionMeta,
    ParsedContent, PreviewPayload, ReasoningOutput, ReasoningTrace, ResolutionLogEntry,
    ResolutionSet, ResolvedEntity, ResolvedRelationship,
};
use crate::errors::{StageError, UpsertError};
use crate::memory::{ArtifactSignal, MemoryAction, MemoryTier, TierAction};
use crate::resolver::{mint_stable_id, ResolutionDecision, ResolverConfig, SurfaceHints};
use crate::schema::{normalize_type_key, TypeKind};
use crate::upsert::{UpsertOperation, UpsertPayload};

/// Node type of the interaction record written on commit.
pub const INTERACTION_TYPE: &str = "Interaction";

/// Relationship from an interaction to each entity it mentions.
pub const MENTIONS_TYPE: &str = "MENTIONS";

/// Registry holding every built-in stage.
pub fn builtin_registry() -> StageRegistry {
    StageRegistry::new()
        .with_stage(Arc::new(ValidateInput))
        .with_stage(Arc::new(ParseInput))
        .with_stage(Arc::new(ExtractMentions))
        .with_stage(Arc::new(ResolveEntities))
        .with_stage(Arc::new(TagMemory))
        .with_stage(Arc::new(AssemblePreview))
        .with_stage(Arc::new(ApplyAnnotations))
        .with_stage(Arc::new(BuildUpserts))
        .with_stage(Arc::new(ApplyUpserts))
        .with_stage(Arc::new(DecaySweep))
        .with_stage(Arc::new(PromoteMemory))
        .with_stage(Arc::new(RecallMemory))
}

macro_rules! payload {
    ($bundle:expr, $variant:ident) => {
        match &$bundle.payload {
            BundlePayload::$variant(inner) => inner,
            other => {
                return Err(StageError::Fatal(format!(
                    "expected a {} payload, got {}",
                    BundleKind::$variant,
                    other.kind()
                )))
            }
        }
    };
}

fn properties_of(entity: &ResolvedEntity) -> BTreeMap<String, Value> {
    entity
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

fn node_operation(entity: &ResolvedEntity) -> UpsertOperation {
    UpsertOperation::node(&entity.type_key, &entity.stable_id, properties_of(entity))
}

fn interaction_node_id(meta: &InteractionMeta) -> String {
    format!("interaction_{}", meta.interaction_id)
}

/// Checks that a raw input is usable before anything expensive runs.
pub struct ValidateInput;

#[async_trait]
impl Stage for ValidateInput {
    fn id(&self) -> &'static str {
        "ingest.validate_input"
    }

    fn input(&self) -> BundleKind {
        BundleKind::RawInput
    }

    fn output(&self) -> BundleKind {
        BundleKind::RawInput
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        let raw = payload!(bundle, RawInput);
        if bundle.meta.interaction_id.trim().is_empty() {
            return Err(StageError::Fatal("interaction_id is required".to_string()));
        }
        let has_text = raw.text.as_deref().map_or(false, |t| !t.trim().is_empty());
        let has_file = raw.file_path.as_deref().map_or(false, |p| !p.trim().is_empty());
        if !has_text && !has_file {
            return Err(StageError::Fatal(
                "raw input has neither text nor a file path".to_string(),
            ));
        }
        Ok(bundle.derive(BundlePayload::RawInput(raw.clone())))
    }
}

/// Turns raw input into plain text. Inline text wins over the file.
pub struct ParseInput;

#[async_trait]
impl Stage for ParseInput {
    fn id(&self) -> &'static str {
        "ingest.parse"
    }

    fn input(&self) -> BundleKind {
        BundleKind::RawInput
    }

    fn output(&self) -> BundleKind {
        BundleKind::ParsedContent
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        let raw = payload!(bundle, RawInput);
        let text = match (&raw.text, &raw.file_path) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
                let msg = format!("reading '{path}': {e}");
                match e.kind() {
                    std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData => StageError::Fatal(msg),
                    _ => StageError::Recoverable(msg),
                }
            })?,
            _ => return Err(StageError::Fatal("nothing to parse".to_string())),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(StageError::Fatal("parsed content is empty".to_string()));
        }
        let tokens = text.split_whitespace().map(str::to_string).collect();
        let language = raw
            .metadata
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(bundle.derive(BundlePayload::ParsedContent(ParsedContent {
            text,
            tokens,
            language,
            metadata: raw.metadata.clone(),
        })))
    }
}

/// Calls the extraction collaborator and sanity-checks its answer.
pub struct ExtractMentions;

#[async_trait]
impl Stage for ExtractMentions {
    fn id(&self) -> &'static str {
        "nlp.extract"
    }

    fn input(&self) -> BundleKind {
        BundleKind::ParsedContent
    }

    fn output(&self) -> BundleKind {
        BundleKind::Extraction
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let content = payload!(bundle, ParsedContent);
        let mut result = ctx
            .services
            .extractor
            .extract(content, &bundle.meta)
            .await?;

        let mut temp_ids = BTreeSet::new();
        for mention in &result.mentions {
            if !temp_ids.insert(mention.temp_id.as_str()) {
                return Err(StageError::Fatal(format!(
                    "extractor returned temp id '{}' twice",
                    mention.temp_id
                )));
            }
        }
        let before = result.relationships.len();
        result
            .relationships
            .retain(|r| temp_ids.contains(r.source.as_str()) && temp_ids.contains(r.target.as_str()));
        if result.relationships.len() < before {
            warn!(
                dropped = before - result.relationships.len(),
                "relationships referencing unknown mentions dropped"
            );
        }

        debug!(
            mentions = result.mentions.len(),
            relationships = result.relationships.len(),
            "extraction received"
        );
        Ok(bundle.derive(BundlePayload::Extraction(result)))
    }
}

/// Resolves every mention against the candidate provider.
pub struct ResolveEntities;

impl ResolveEntities {
    /// Fill context attributes the mention does not carry itself.
    fn with_context(
        mention: &EntityMention,
        ctx: &StageContext,
        meta: &InteractionMeta,
        config: &ResolverConfig,
    ) -> EntityMention {
        let mut mention = mention.clone();
        for key in &config.context_keys {
            if mention.attribute(key).is_some() {
                continue;
            }
            let from_ctx = ctx.attribute(key).map(str::to_string).or_else(|| {
                (key == "project").then(|| meta.project_id.clone()).flatten()
            });
            if let Some(value) = from_ctx {
                mention.attributes.insert(key.clone(), value);
            }
        }
        mention
    }
}

#[async_trait]
impl Stage for ResolveEntities {
    fn id(&self) -> &'static str {
        "normalise.resolve_entities"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Extraction
    }

    fn output(&self) -> BundleKind {
        BundleKind::Resolution
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let extraction = payload!(bundle, Extraction);
        let services = &ctx.services;
        let config = services.resolver.config();
        let meta = &bundle.meta;

        let mut set = ResolutionSet {
            metrics: extraction.metrics.clone(),
            summary: extraction.summary.clone(),
            ..Default::default()
        };

        for raw in &extraction.mentions {
            let type_key = match normalize_type_key(TypeKind::Node, &raw.type_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(temp_id = %raw.temp_id, error = %e, "mention with invalid type dropped");
                    set.log.push(ResolutionLogEntry {
                        temp_id: raw.temp_id.clone(),
                        type_key: raw.type_key.clone(),
                        outcome: "rejected".to_string(),
                        confidence: 0.0,
                        candidates: Vec::new(),
                    });
                    continue;
                }
            };
            let mut mention = Self::with_context(raw, ctx, meta, config);
            mention.type_key = type_key.clone();

            let hints = SurfaceHints {
                name: mention.name().map(str::to_string),
                keys: config
                    .stable_keys
                    .iter()
                    .filter_map(|k| mention.attribute(k).map(|v| (k.clone(), v.to_string())))
                    .collect(),
            };
            let index = services.candidates.candidates(&type_key, &hints).await?;
            let decision = services.resolver.resolve(&mention, &index);

            let stable_id = match decision.canonical_id() {
                Some(id) => id.to_string(),
                None => mint_stable_id(
                    &type_key,
                    &mention.attributes,
                    &format!("{}:{}", meta.interaction_id, mention.temp_id),
                ),
            };
            let artifact_id = match &decision {
                ResolutionDecision::Ambiguous { .. } => {
                    format!("pending:{}:{}", meta.interaction_id, mention.temp_id)
                }
                _ => format!("entity:{stable_id}"),
            };

            let clean_match = matches!(
                decision,
                ResolutionDecision::Matched {
                    needs_review: false,
                    ..
                }
            );
            if !clean_match {
                let candidates = match &decision {
                    ResolutionDecision::Ambiguous { candidates, .. } => {
                        candidates.iter().map(|c| c.id.clone()).collect()
                    }
                    other => other.canonical_id().map(str::to_string).into_iter().collect(),
                };
                let outcome = if decision.requires_review() && !decision.is_new() {
                    "review"
                } else {
                    decision.outcome()
                };
                set.log.push(ResolutionLogEntry {
                    temp_id: mention.temp_id.clone(),
                    type_key: type_key.clone(),
                    outcome: outcome.to_string(),
                    confidence: decision.confidence(),
                    candidates,
                });
            }

            set.entities.push(ResolvedEntity {
                temp_id: mention.temp_id,
                type_key,
                attributes: mention.attributes,
                provenance: mention.provenance,
                decision,
                stable_id,
                artifact_id,
                action: None,
                marker: None,
                identity_history: Vec::new(),
            });
        }

        for rel in &extraction.relationships {
            if set.entity(&rel.source).is_none() || set.entity(&rel.target).is_none() {
                continue;
            }
            match normalize_type_key(TypeKind::Relationship, &rel.rel_type) {
                Ok(rel_type) => set.relationships.push(ResolvedRelationship {
                    source: rel.source.clone(),
                    target: rel.target.clone(),
                    rel_type,
                    properties: rel.properties.clone(),
                    confidence: rel.confidence,
                }),
                Err(e) => warn!(error = %e, "relationship with invalid type dropped"),
            }
        }

        // Two mentions landing on the same identity are one entity.
        let mut first_by_id: BTreeMap<&str, &str> = BTreeMap::new();
        let mut duplicates = BTreeMap::new();
        for entity in &set.entities {
            if matches!(entity.decision, ResolutionDecision::Ambiguous { .. }) {
                continue;
            }
            match first_by_id.get(entity.stable_id.as_str()) {
                Some(first) => {
                    duplicates.insert(entity.temp_id.clone(), first.to_string());
                }
                None => {
                    first_by_id.insert(&entity.stable_id, &entity.temp_id);
                }
            }
        }
        if !duplicates.is_empty() {
            set = reassign_identities(&set, &duplicates, "duplicate mention", Utc::now());
        }

        let count = |outcome: &str| set.entities.iter().filter(|e| e.decision.outcome() == outcome).count();
        info!(
            entities = set.entities.len(),
            matched = count("matched"),
            new = count("new"),
            ambiguous = count("ambiguous"),
            merged = duplicates.len(),
            "mentions resolved"
        );
        Ok(bundle.derive(BundlePayload::Resolution(set)))
    }
}

/// Tags every resolved entity with a memory tier.
pub struct TagMemory;

#[async_trait]
impl Stage for TagMemory {
    fn id(&self) -> &'static str {
        "memory.tag"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Resolution
    }

    fn output(&self) -> BundleKind {
        BundleKind::Resolution
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let mut set = payload!(bundle, Resolution).clone();
        let memory = &ctx.services.memory;
        let now = Utc::now();

        for entity in set.entities.iter_mut() {
            let payload = match entity.decision {
                ResolutionDecision::Ambiguous { .. } => Value::Null,
                _ => serde_json::to_value(node_operation(entity))
                    .map_err(|e| StageError::Fatal(e.to_string()))?,
            };
            let signal = ArtifactSignal {
                artifact_id: entity.artifact_id.clone(),
                importance: entity.provenance.extraction_confidence,
                confidence: entity.decision.confidence(),
                pending_review: entity.decision.requires_review() && !entity.is_confirmed(),
                retain: entity.is_new() && entity.action.is_none(),
                user_confirmed: entity.is_confirmed(),
                pinned: false,
                payload,
            };
            let (marker, action) = memory.tag(signal, Some(ctx.run_id), now);
            ctx.record(action);
            entity.marker = Some(marker);
        }

        Ok(bundle.derive(BundlePayload::Resolution(set)))
    }
}

/// Builds the reviewer preview.
pub struct AssemblePreview;

#[async_trait]
impl Stage for AssemblePreview {
    fn id(&self) -> &'static str {
        "preview.assemble"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Resolution
    }

    fn output(&self) -> BundleKind {
        BundleKind::Preview
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        let set = payload!(bundle, Resolution);
        Ok(bundle.derive(BundlePayload::Preview(PreviewPayload::from_resolution(set))))
    }
}

/// Folds reviewer annotations back into a resolution.
pub struct ApplyAnnotations;

#[async_trait]
impl Stage for ApplyAnnotations {
    fn id(&self) -> &'static str {
        "commit.apply_annotations"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Preview
    }

    fn output(&self) -> BundleKind {
        BundleKind::Resolution
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        let preview = payload!(bundle, Preview);
        let set = preview.apply_annotations(Utc::now())?;
        Ok(bundle.derive(BundlePayload::Resolution(set)))
    }
}

/// Converts long-term entities into upsert operations.
///
/// Emits one interaction node, a node per long-term entity, a `MENTIONS`
/// edge from the interaction to each of them, and the relationships whose
/// endpoints are both long-term. Entities whose decision still needs a
/// reviewer are deferred with everything else.
///
/// The interaction node is the record of the run itself and is always
/// written; it is not tagged by the memory tier manager.
pub struct BuildUpserts;

#[async_trait]
impl Stage for BuildUpserts {
    fn id(&self) -> &'static str {
        "graph.build_upserts"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Resolution
    }

    fn output(&self) -> BundleKind {
        BundleKind::Upsert
    }

    async fn run(&self, bundle: &Bundle, _ctx: &StageContext) -> Result<Bundle, StageError> {
        let set = payload!(bundle, Resolution);
        let meta = &bundle.meta;
        let interaction_id = interaction_node_id(meta);

        let mut interaction = BTreeMap::new();
        interaction.insert("interaction_id".to_string(), json!(meta.interaction_id));
        interaction.insert("interaction_type".to_string(), json!(meta.interaction_type));
        interaction.insert("interaction_at".to_string(), json!(meta.interaction_at.to_rfc3339()));
        interaction.insert(
            "source_type".to_string(),
            serde_json::to_value(meta.source_type).unwrap_or_default(),
        );
        if let Some(uri) = &meta.source_uri {
            interaction.insert("source_uri".to_string(), json!(uri));
        }
        if let Some(project) = &meta.project_id {
            interaction.insert("project_id".to_string(), json!(project));
        }
        if let Some(summary) = &set.summary {
            interaction.insert("summary".to_string(), json!(summary));
        }
        if !set.metrics.is_empty() {
            interaction.insert("metrics".to_string(), json!(set.metrics));
        }

        let mut operations = vec![UpsertOperation::node(
            INTERACTION_TYPE,
            &interaction_id,
            interaction,
        )];
        let mut deferred = Vec::new();
        let mut persisted: BTreeMap<&str, &str> = BTreeMap::new();

        for entity in &set.entities {
            let long_term = entity
                .marker
                .as_ref()
                .map_or(false, |m| m.tier == MemoryTier::LongTerm);
            let unreviewed = entity.decision.requires_review() && !entity.is_confirmed();
            if !long_term || unreviewed {
                deferred.push(entity.artifact_id.clone());
                continue;
            }
            operations.push(node_operation(entity));
            operations.push(UpsertOperation::relationship(
                MENTIONS_TYPE,
                &interaction_id,
                &entity.stable_id,
                BTreeMap::new(),
            ));
            persisted.insert(&entity.temp_id, &entity.stable_id);
        }

        for rel in &set.relationships {
            match (persisted.get(rel.source.as_str()), persisted.get(rel.target.as_str())) {
                (Some(source), Some(target)) => {
                    let mut properties = rel.properties.clone();
                    if let Some(confidence) = rel.confidence {
                        properties.insert("confidence".to_string(), json!(confidence));
                    }
                    operations.push(UpsertOperation::relationship(
                        &rel.rel_type,
                        *source,
                        *target,
                        properties,
                    ));
                }
                _ => deferred.push(format!("{}:{}->{}", rel.rel_type, rel.source, rel.target)),
            }
        }

        info!(
            operations = operations.len(),
            deferred = deferred.len(),
            "upsert batch built"
        );
        Ok(bundle.derive(BundlePayload::Upsert(UpsertPayload {
            operations,
            deferred,
            result: None,
        })))
    }
}

/// Applies an upsert batch.
///
/// A batch that applied nothing because the store failed or reported a
/// conflict is retried; anything else is reported in the bundle.
pub struct ApplyUpserts;

#[async_trait]
impl Stage for ApplyUpserts {
    fn id(&self) -> &'static str {
        "graph.upsert"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Upsert
    }

    fn output(&self) -> BundleKind {
        BundleKind::Upsert
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let payload = payload!(bundle, Upsert);
        let result = ctx
            .services
            .upserts
            .apply(&payload.operations, &ctx.actor)
            .await;

        let retryable = result.applied.is_empty()
            && result.failed.iter().any(|f| {
                matches!(
                    f.error,
                    UpsertError::Store { .. } | UpsertError::UpsertConflict { .. }
                )
            });
        if retryable {
            return Err(StageError::Recoverable(format!(
                "graph store did not accept the batch: {result}"
            )));
        }
        if !result.is_complete() {
            warn!(status = ?result.status, failed = result.failed.len(), "upsert batch incomplete");
        }

        let mut next = payload.clone();
        next.result = Some(result);
        Ok(bundle.derive(BundlePayload::Upsert(next)))
    }
}

/// Decays the memory tiers and applies schema usage rules.
pub struct DecaySweep;

#[async_trait]
impl Stage for DecaySweep {
    fn id(&self) -> &'static str {
        "memory.decay_sweep"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Consolidation
    }

    fn output(&self) -> BundleKind {
        BundleKind::Consolidation
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let mut request = payload!(bundle, Consolidation).clone();
        let now = Utc::now();

        let report = ctx.services.memory.decay_sweep(now)?;
        for id in &report.demoted {
            ctx.record(MemoryAction {
                artifact_id: id.clone(),
                action: TierAction::Demoted,
                tier: Some(MemoryTier::ShortTerm),
            });
        }
        for id in &report.evicted {
            ctx.record(MemoryAction {
                artifact_id: id.clone(),
                action: TierAction::Evicted,
                tier: None,
            });
        }

        request.deprecated_types = ctx.services.schema.apply_usage_rules(now)?;
        request.sweep = Some(report);
        Ok(bundle.derive(BundlePayload::Consolidation(request)))
    }
}

/// Promotes eligible mid-term artifacts and emits their upserts.
pub struct PromoteMemory;

#[async_trait]
impl Stage for PromoteMemory {
    fn id(&self) -> &'static str {
        "memory.promote"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Consolidation
    }

    fn output(&self) -> BundleKind {
        BundleKind::Upsert
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let _request = payload!(bundle, Consolidation);
        let memory = &ctx.services.memory;
        let now = Utc::now();

        let mut operations = Vec::new();
        let mut deferred = Vec::new();
        for artifact in memory.promote_eligible(now) {
            let id = artifact.marker.artifact_id;
            ctx.record(MemoryAction {
                artifact_id: id.clone(),
                action: TierAction::Promoted,
                tier: Some(MemoryTier::LongTerm),
            });
            match memory
                .long_term_payload(&id)
                .and_then(|v| serde_json::from_value::<UpsertOperation>(v).ok())
            {
                Some(op) => operations.push(op.with_tier(MemoryTier::LongTerm)),
                None => deferred.push(id),
            }
        }

        let stale = memory.stale_long_term(now);
        if !stale.is_empty() {
            info!(count = stale.len(), "long-term artifacts have gone stale");
        }

        Ok(bundle.derive(BundlePayload::Upsert(UpsertPayload {
            operations,
            deferred,
            result: None,
        })))
    }
}

/// Recalls what memory holds about the entities of a query.
pub struct RecallMemory;

#[async_trait]
impl Stage for RecallMemory {
    fn id(&self) -> &'static str {
        "reasoning.recall"
    }

    fn input(&self) -> BundleKind {
        BundleKind::Resolution
    }

    fn output(&self) -> BundleKind {
        BundleKind::Reasoning
    }

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError> {
        let set = payload!(bundle, Resolution);
        let memory = &ctx.services.memory;
        let now = Utc::now();

        let query = ctx
            .attribute("query")
            .map(str::to_string)
            .or_else(|| set.summary.clone())
            .unwrap_or_else(|| bundle.meta.interaction_id.clone());
        let mut output = ReasoningOutput {
            query,
            ..Default::default()
        };

        for entity in &set.entities {
            let Some(artifact) = memory.get(&entity.artifact_id) else {
                output.unknown_mentions.push(entity.temp_id.clone());
                continue;
            };
            let marker = if artifact.marker.tier == MemoryTier::MidTerm {
                let marker = memory.reinforce(&entity.artifact_id, now)?;
                ctx.record(MemoryAction {
                    artifact_id: entity.artifact_id.clone(),
                    action: TierAction::Reinforced,
                    tier: Some(marker.tier),
                });
                marker
            } else {
                artifact.marker
            };
            output.traces.push(ReasoningTrace {
                artifact_id: entity.artifact_id.clone(),
                canonical_id: entity.decision.canonical_id().map(str::to_string),
                tier: marker.tier,
                strength: marker.strength,
                payload: artifact.payload,
            });
        }

        Ok(bundle.derive(BundlePayload::Reasoning(output)))
    }
}
