//! Entity resolution: map extracted mentions to canonical identifiers.
//!
//! Resolution runs in priority order:
//! 1. Exact match on a stable external key (email, domain, code, external id)
//! 2. Fuzzy match on the normalised name against same-type candidates
//! 3. Disambiguation of close survivors by shared context attributes
//!
//! [`EntityResolver::resolve`] is a pure function of the mention, the
//! candidate snapshot and the configured thresholds. Equal inputs always
//! produce equal decisions: candidates are ordered by score, then by id.

pub mod index;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::bundles::EntityMention;
use crate::utils::{name_similarity, normalize_entity_name, normalize_key, normalize_whitespace};

pub use index::{
    CandidateIndex, CandidateProvider, CanonicalEntity, StaticCandidateProvider, SurfaceHints,
};

/// How a match was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Fuzzy,
    Disambiguated,
    /// A person confirmed or assigned the identity.
    Confirmed,
}

/// A candidate that survived the similarity floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub context_hits: usize,
}

/// Outcome of resolving one mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionDecision {
    Matched {
        canonical_id: String,
        confidence: f64,
        strategy: MatchStrategy,
        /// Confidence is below the auto-merge floor; a person must confirm.
        needs_review: bool,
    },
    Ambiguous {
        candidates: Vec<ScoredCandidate>,
        confidence: f64,
    },
    New,
}

impl ResolutionDecision {
    /// A match a person asserted; always full confidence.
    pub fn confirmed(canonical_id: impl Into<String>) -> Self {
        ResolutionDecision::Matched {
            canonical_id: canonical_id.into(),
            confidence: 1.0,
            strategy: MatchStrategy::Confirmed,
            needs_review: false,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            ResolutionDecision::Matched { confidence, .. }
            | ResolutionDecision::Ambiguous { confidence, .. } => *confidence,
            ResolutionDecision::New => 0.0,
        }
    }

    pub fn canonical_id(&self) -> Option<&str> {
        match self {
            ResolutionDecision::Matched { canonical_id, .. } => Some(canonical_id),
            _ => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ResolutionDecision::New)
    }

    /// Ambiguous decisions and mid-band matches must be surfaced to a person.
    pub fn requires_review(&self) -> bool {
        match self {
            ResolutionDecision::Matched { needs_review, .. } => *needs_review,
            ResolutionDecision::Ambiguous { .. } => true,
            ResolutionDecision::New => false,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            ResolutionDecision::Matched { .. } => "matched",
            ResolutionDecision::Ambiguous { .. } => "ambiguous",
            ResolutionDecision::New => "new",
        }
    }
}

fn validate_floors(config: &ResolverConfig) -> Result<(), ValidationError> {
    if config.reject_floor > config.auto_merge_floor {
        return Err(ValidationError::new(
            "reject_floor must not exceed auto_merge_floor",
        ));
    }
    Ok(())
}

/// Thresholds and key lists, loaded from `rules/resolution.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_floors"))]
pub struct ResolverConfig {
    /// Minimum name similarity for a candidate to be considered at all.
    #[validate(range(min = 0.0, max = 1.0))]
    pub similarity_floor: f64,

    /// Best scores below this resolve to `New`.
    #[validate(range(min = 0.0, max = 1.0))]
    pub reject_floor: f64,

    /// Matches at or above this merge without review.
    #[validate(range(min = 0.0, max = 1.0))]
    pub auto_merge_floor: f64,

    /// Candidates within this distance of the best score are considered tied.
    #[validate(range(min = 0.0, max = 1.0))]
    pub ambiguity_gap: f64,

    /// Attribute names treated as stable external keys, in priority order.
    pub stable_keys: Vec<String>,

    /// Attribute names used to break ties.
    pub context_keys: Vec<String>,

    /// Trailing tokens stripped from names before comparison.
    pub legal_suffixes: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.80,
            reject_floor: 0.85,
            auto_merge_floor: 0.92,
            ambiguity_gap: 0.03,
            stable_keys: ["email", "domain", "code", "external_id"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            context_keys: ["organization", "project", "location"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            legal_suffixes: [
                "pty", "ltd", "limited", "inc", "incorporated", "llc", "llp", "plc", "gmbh",
                "ag", "corp", "corporation", "co", "company", "sa", "bv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Stateless resolver parameterised by [`ResolverConfig`].
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `mention` against the same-type entities of `index`.
    pub fn resolve(&self, mention: &EntityMention, index: &CandidateIndex) -> ResolutionDecision {
        let same_type: Vec<&CanonicalEntity> = index
            .entities()
            .iter()
            .filter(|c| c.type_key.eq_ignore_ascii_case(&mention.type_key))
            .collect();

        if same_type.is_empty() {
            return ResolutionDecision::New;
        }

        let exact = self.exact_matches(mention, &same_type);
        match exact.len() {
            0 => {}
            1 => {
                return ResolutionDecision::Matched {
                    canonical_id: exact[0].id.clone(),
                    confidence: 1.0,
                    strategy: MatchStrategy::Exact,
                    needs_review: false,
                }
            }
            _ => {
                let scored = exact
                    .iter()
                    .map(|c| ScoredCandidate {
                        id: c.id.clone(),
                        score: 1.0,
                        context_hits: 0,
                    })
                    .collect();
                return self.disambiguate(mention, &same_type, scored, MatchStrategy::Exact);
            }
        }

        let Some(name) = mention.name() else {
            return ResolutionDecision::New;
        };
        let normalized = normalize_entity_name(name, &self.config.legal_suffixes);
        if normalized.is_empty() {
            return ResolutionDecision::New;
        }

        let mut scored: Vec<ScoredCandidate> = same_type
            .iter()
            .filter_map(|c| {
                let candidate_name = c.attribute("name")?;
                let score = name_similarity(
                    &normalized,
                    &normalize_entity_name(candidate_name, &self.config.legal_suffixes),
                );
                (score >= self.config.similarity_floor).then(|| ScoredCandidate {
                    id: c.id.clone(),
                    score,
                    context_hits: 0,
                })
            })
            .collect();
        sort_candidates(&mut scored);

        let Some(best) = scored.first().map(|c| c.score) else {
            return ResolutionDecision::New;
        };
        if best < self.config.reject_floor {
            return ResolutionDecision::New;
        }

        let contenders: Vec<ScoredCandidate> = scored
            .into_iter()
            .filter(|c| best - c.score <= self.config.ambiguity_gap)
            .collect();

        if contenders.len() == 1 {
            let winner = &contenders[0];
            return self.matched(winner.id.clone(), winner.score, MatchStrategy::Fuzzy);
        }

        self.disambiguate(mention, &same_type, contenders, MatchStrategy::Fuzzy)
    }

    fn matched(&self, id: String, score: f64, strategy: MatchStrategy) -> ResolutionDecision {
        let confidence = score.clamp(0.0, 1.0);
        ResolutionDecision::Matched {
            canonical_id: id,
            confidence,
            strategy,
            needs_review: confidence < self.config.auto_merge_floor,
        }
    }

    /// Candidates sharing any configured stable key with the mention, taking
    /// the first key (in priority order) that produces a match.
    fn exact_matches<'a>(
        &self,
        mention: &EntityMention,
        candidates: &[&'a CanonicalEntity],
    ) -> Vec<&'a CanonicalEntity> {
        for key in &self.config.stable_keys {
            let Some(value) = mention.attribute(key).map(normalize_key) else {
                continue;
            };
            let mut matches: Vec<&CanonicalEntity> = candidates
                .iter()
                .copied()
                .filter(|c| c.attribute(key).map(normalize_key).as_deref() == Some(value.as_str()))
                .collect();
            if !matches.is_empty() {
                matches.sort_by(|a, b| a.id.cmp(&b.id));
                matches.dedup_by(|a, b| a.id == b.id);
                return matches;
            }
        }
        Vec::new()
    }

    /// Break a tie between `contenders` by counting shared context attributes.
    fn disambiguate(
        &self,
        mention: &EntityMention,
        candidates: &[&CanonicalEntity],
        mut contenders: Vec<ScoredCandidate>,
        base: MatchStrategy,
    ) -> ResolutionDecision {
        for contender in contenders.iter_mut() {
            if let Some(candidate) = candidates.iter().find(|c| c.id == contender.id) {
                contender.context_hits = self.context_hits(mention, candidate);
            }
        }

        let max_hits = contenders.iter().map(|c| c.context_hits).max().unwrap_or(0);
        let leaders: Vec<&ScoredCandidate> = contenders
            .iter()
            .filter(|c| c.context_hits == max_hits)
            .collect();

        if max_hits > 0 && leaders.len() == 1 {
            let strategy = match base {
                MatchStrategy::Exact => MatchStrategy::Exact,
                _ => MatchStrategy::Disambiguated,
            };
            return self.matched(leaders[0].id.clone(), leaders[0].score, strategy);
        }

        sort_candidates(&mut contenders);
        let confidence = contenders.first().map(|c| c.score).unwrap_or(0.0).clamp(0.0, 1.0);
        ResolutionDecision::Ambiguous {
            candidates: contenders,
            confidence,
        }
    }

    fn context_hits(&self, mention: &EntityMention, candidate: &CanonicalEntity) -> usize {
        self.config
            .context_keys
            .iter()
            .filter(|key| match (mention.attribute(key), candidate.attribute(key)) {
                (Some(a), Some(b)) => {
                    normalize_entity_name(a, &self.config.legal_suffixes)
                        == normalize_entity_name(b, &self.config.legal_suffixes)
                }
                _ => false,
            })
            .count()
    }
}

fn sort_candidates(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Deterministic stable id for an entity that has no canonical identity yet.
///
/// The same type and identity basis always mint the same id, so an entity
/// mentioned again in a later interaction lands on the same node.
pub fn mint_stable_id(
    type_key: &str,
    attributes: &BTreeMap<String, String>,
    fallback: &str,
) -> String {
    let basis = attributes
        .get("name")
        .map(|n| normalize_whitespace(n).to_lowercase())
        .filter(|n| !n.is_empty())
        .or_else(|| {
            ["email", "external_id", "code", "domain"]
                .iter()
                .find_map(|k| attributes.get(*k).map(|v| normalize_key(v)))
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| fallback.to_string());

    let type_lower = type_key.to_lowercase();
    let digest = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{type_lower}:{basis}").as_bytes(),
    );
    format!("{}_{}", type_lower, digest.simple())
}
