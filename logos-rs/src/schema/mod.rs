//! Runtime-extensible schema registry.
//!
//! Node and relationship types are data, not code. New types enter only via
//! [`SchemaRegistry::register_or_touch`]; types are never deleted, only
//! deprecated. Every mutation bumps a monotonic version counter and is
//! persisted through a [`SchemaStore`].

pub mod registry;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::utils::datetime::flexible_option;

pub use registry::{DeprecationPolicy, SchemaRegistry, Touch};
pub use store::{MemorySchemaStore, SchemaStore, YamlSchemaStore};

/// Whether a type describes nodes or relationships.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    #[default]
    Node,
    Relationship,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Node => f.write_str("node"),
            TypeKind::Relationship => f.write_str("relationship"),
        }
    }
}

/// Structural category of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCategory {
    Form,
    Concept,
    Particular,
}

/// One registered type. `key` and `kind` come from the document layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    #[serde(skip)]
    pub key: String,
    #[serde(skip)]
    pub kind: TypeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TypeCategory>,
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub introduced_in_version: u64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, with = "flexible_option", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_reason: Option<String>,
}

impl TypeDefinition {
    pub fn new(kind: TypeKind, key: impl Into<String>, version: u64) -> Self {
        Self {
            key: key.into(),
            kind,
            category: None,
            properties: BTreeSet::new(),
            introduced_in_version: version,
            usage_count: 0,
            last_used: None,
            deprecated: false,
            deprecation_reason: None,
        }
    }
}

/// Usage thresholds for automatic deprecation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprecationRules {
    /// Types used at most this many times are candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_usage: Option<u64>,
    /// ...once they have not been used for this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_days: Option<i64>,
}

/// The persisted form of the registry, and its in-memory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub version: u64,
    #[serde(default, with = "flexible_option", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rules: DeprecationRules,
    #[serde(default)]
    pub node_types: BTreeMap<String, TypeDefinition>,
    #[serde(default)]
    pub relationship_types: BTreeMap<String, TypeDefinition>,
}

impl SchemaDocument {
    /// Fill `key`/`kind` on every definition from the map it sits in.
    pub(crate) fn hydrate(mut self) -> Self {
        for (key, def) in self.node_types.iter_mut() {
            def.key = key.clone();
            def.kind = TypeKind::Node;
        }
        for (key, def) in self.relationship_types.iter_mut() {
            def.key = key.clone();
            def.kind = TypeKind::Relationship;
        }
        self
    }

    pub fn types(&self, kind: TypeKind) -> &BTreeMap<String, TypeDefinition> {
        match kind {
            TypeKind::Node => &self.node_types,
            TypeKind::Relationship => &self.relationship_types,
        }
    }

    pub(crate) fn types_mut(&mut self, kind: TypeKind) -> &mut BTreeMap<String, TypeDefinition> {
        match kind {
            TypeKind::Node => &mut self.node_types,
            TypeKind::Relationship => &mut self.relationship_types,
        }
    }

    pub fn get(&self, kind: TypeKind, key: &str) -> Option<&TypeDefinition> {
        self.types(kind).get(key)
    }

    /// Look a key up among nodes first, then relationships.
    pub fn find(&self, key: &str) -> Option<&TypeDefinition> {
        self.node_types
            .get(key)
            .or_else(|| self.relationship_types.get(key))
    }

    /// Same type definitions, ignoring version bookkeeping.
    pub(crate) fn same_types(&self, other: &SchemaDocument) -> bool {
        self.node_types == other.node_types
            && self.relationship_types == other.relationship_types
            && self.rules == other.rules
    }
}

static LABEL_RE: OnceLock<Regex> = OnceLock::new();
static REL_TYPE_RE: OnceLock<Regex> = OnceLock::new();

fn label_re() -> &'static Regex {
    LABEL_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z0-9_]*$").expect("static regex is valid"))
}

fn rel_type_re() -> &'static Regex {
    REL_TYPE_RE.get_or_init(|| Regex::new(r"^[A-Z0-9_]+$").expect("static regex is valid"))
}

/// Canonical spelling of a type key.
///
/// Node labels get an upper-cased first letter (`person` → `Person`);
/// relationship types are upper-cased with spaces and dashes turned into
/// underscores (`works for` → `WORKS_FOR`). Keys that still do not match the
/// allowed pattern are rejected.
pub fn normalize_type_key(kind: TypeKind, raw: &str) -> Result<String, SchemaError> {
    let trimmed = raw.trim();
    let candidate = match kind {
        TypeKind::Node => {
            let mut chars = trimmed.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        }
        TypeKind::Relationship => trimmed
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect::<String>()
            .to_uppercase(),
    };

    let valid = match kind {
        TypeKind::Node => label_re().is_match(&candidate),
        TypeKind::Relationship => rel_type_re().is_match(&candidate),
    };
    if valid {
        Ok(candidate)
    } else {
        Err(SchemaError::InvalidKey {
            key: raw.to_string(),
            kind,
        })
    }
}
