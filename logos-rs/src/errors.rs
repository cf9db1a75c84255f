//! Error types for logos-rs.

use serde::{Deserialize, Serialize};

use crate::bundles::BundleKind;
use crate::memory::MemoryTier;
use crate::schema::TypeKind;

/// Alias for Results returning [`LogosError`].
pub type Result<T> = std::result::Result<T, LogosError>;

/// Top-level error type for logos-rs.
#[derive(Debug, thiserror::Error)]
pub enum LogosError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Stage '{stage_id}' expects a {expected} bundle but received {found}")]
    StageTypeMismatch {
        stage_id: String,
        expected: BundleKind,
        found: BundleKind,
    },

    #[error("Stage '{stage_id}' failed after {attempts} attempt(s): {source}")]
    Stage {
        stage_id: String,
        attempts: u32,
        #[source]
        source: StageError,
    },

    #[error("Run deadline exceeded during stage '{stage_id}'")]
    DeadlineExceeded { stage_id: String },

    #[error("Pipeline configuration error: {0}")]
    PipelineConfig(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Graph store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl LogosError {
    /// Create an IO error with a path context.
    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        LogosError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Failure raised by a single pipeline stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// Transient condition; the executor retries the stage with backoff.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StageError::Recoverable(_))
    }
}

/// Schema registry errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Write to deprecated type '{key}': {reason}")]
    DeprecatedTypeWrite { key: String, reason: String },

    #[error("Invalid {kind} type key '{key}'")]
    InvalidKey { key: String, kind: TypeKind },

    #[error("Type '{key}' is registered as a {registered} type, not a {requested} type")]
    KindMismatch {
        key: String,
        registered: TypeKind,
        requested: TypeKind,
    },

    #[error("Schema persistence failed: {0}")]
    Persistence(String),
}

/// Memory tier manager errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("A decay sweep is already running")]
    SweepInProgress,

    #[error("Artifact '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: MemoryTier,
        to: MemoryTier,
    },
}

/// Errors reported by a graph store backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Write conflict on '{id}': expected version {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),
}

/// Errors reported by the extraction collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractorError {
    #[error("Extraction timed out: {0}")]
    Timeout(String),

    #[error("Extraction service unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed extraction result: {0}")]
    Malformed(String),
}

/// Per-operation failure inside an upsert batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum UpsertError {
    #[error("unknown type '{type_key}'")]
    UnknownType { type_key: String },

    #[error("write to deprecated type '{type_key}': {reason}")]
    DeprecatedTypeWrite { type_key: String, reason: String },

    #[error("artifact is tagged {tier}; only long_term artifacts may be persisted")]
    NotLongTerm { tier: MemoryTier },

    #[error("relationship endpoint '{endpoint}' is not materialized")]
    DanglingReference { endpoint: String },

    #[error("write conflict on '{id}': expected version {expected}, found {found}")]
    UpsertConflict { id: String, expected: u64, found: u64 },

    #[error("graph store error: {message}")]
    Store { message: String },

    #[error("not attempted: {reason}")]
    NotAttempted { reason: String },
}

impl From<StoreError> for UpsertError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                id,
                expected,
                found,
            } => UpsertError::UpsertConflict {
                id,
                expected,
                found,
            },
            StoreError::NodeNotFound(endpoint) => UpsertError::DanglingReference { endpoint },
            other => UpsertError::Store {
                message: other.to_string(),
            },
        }
    }
}

impl From<ExtractorError> for StageError {
    fn from(err: ExtractorError) -> Self {
        match err {
            ExtractorError::Timeout(_) | ExtractorError::Unavailable(_) => {
                StageError::Recoverable(err.to_string())
            }
            ExtractorError::Malformed(_) => StageError::Fatal(err.to_string()),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::Conflict { .. } => {
                StageError::Recoverable(err.to_string())
            }
            StoreError::NodeNotFound(_) => StageError::Fatal(err.to_string()),
        }
    }
}

impl From<SchemaError> for StageError {
    fn from(err: SchemaError) -> Self {
        StageError::Fatal(err.to_string())
    }
}

impl From<MemoryError> for StageError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::SweepInProgress => StageError::Recoverable(err.to_string()),
            _ => StageError::Fatal(err.to_string()),
        }
    }
}
