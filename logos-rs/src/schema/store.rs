//! Persistence adapters for the schema registry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::SchemaDocument;
use crate::errors::SchemaError;

/// Where the registry's document lives.
pub trait SchemaStore: Send + Sync {
    fn load(&self) -> Result<SchemaDocument, SchemaError>;

    fn save(&self, document: &SchemaDocument) -> Result<(), SchemaError>;

    /// Changes whenever the stored document changes. `None` disables
    /// change detection for hot reload.
    fn fingerprint(&self) -> Option<SystemTime> {
        None
    }
}

/// Human-editable YAML file. A missing file loads as an empty schema.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash never leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct YamlSchemaStore {
    path: PathBuf,
}

impl YamlSchemaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SchemaStore for YamlSchemaStore {
    fn load(&self) -> Result<SchemaDocument, SchemaError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SchemaDocument::default())
            }
            Err(e) => {
                return Err(SchemaError::Persistence(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };
        if raw.trim().is_empty() {
            return Ok(SchemaDocument::default());
        }
        let doc: SchemaDocument = serde_yaml::from_str(&raw).map_err(|e| {
            SchemaError::Persistence(format!("{}: {e}", self.path.display()))
        })?;
        Ok(doc.hydrate())
    }

    fn save(&self, document: &SchemaDocument) -> Result<(), SchemaError> {
        let persistence = |e: &dyn std::fmt::Display| {
            SchemaError::Persistence(format!("{}: {e}", self.path.display()))
        };

        let yaml = serde_yaml::to_string(document).map_err(|e| persistence(&e))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| persistence(&e))?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, yaml).map_err(|e| persistence(&e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| persistence(&e))?;
        Ok(())
    }

    fn fingerprint(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// In-process store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemorySchemaStore {
    document: Mutex<SchemaDocument>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemorySchemaStore {
    pub fn new(document: SchemaDocument) -> Self {
        Self {
            document: Mutex::new(document.hydrate()),
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    /// Make subsequent saves fail, to exercise persistence errors.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    /// Last saved document.
    pub fn document(&self) -> SchemaDocument {
        self.document.lock().clone()
    }
}

impl SchemaStore for MemorySchemaStore {
    fn load(&self) -> Result<SchemaDocument, SchemaError> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &SchemaDocument) -> Result<(), SchemaError> {
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(SchemaError::Persistence("store is read-only".to_string()));
        }
        *self.document.lock() = document.clone();
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
