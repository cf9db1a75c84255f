use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{normalize_type_key, SchemaDocument, SchemaStore, TypeCategory, TypeDefinition, TypeKind};
use crate::errors::SchemaError;

/// What happens when a write touches a deprecated type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeprecationPolicy {
    /// Allow the write and report a warning.
    #[default]
    Warn,
    /// Refuse the write.
    Block,
}

impl FromStr for DeprecationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(DeprecationPolicy::Warn),
            "block" => Ok(DeprecationPolicy::Block),
            other => Err(format!("unknown deprecation policy '{other}' (expected warn|block)")),
        }
    }
}

/// Result of [`SchemaRegistry::register_or_touch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Touch {
    pub definition: TypeDefinition,
    pub created: bool,
    /// Set when the type is deprecated and the policy allowed the write.
    pub warning: Option<SchemaError>,
    /// Schema version after the mutation.
    pub version: u64,
}

/// Versioned, process-wide type registry.
///
/// Readers get an immutable [`SchemaDocument`] snapshot and never block on
/// writers for longer than an `Arc` clone. Mutations are serialized through a
/// single writer lock, persisted, and only then published as the new
/// snapshot; a failed save leaves the registry unchanged.
pub struct SchemaRegistry {
    snapshot: RwLock<Arc<SchemaDocument>>,
    /// Single-writer lock; holds the store fingerprint last seen.
    writer: Mutex<Option<SystemTime>>,
    store: Box<dyn SchemaStore>,
    policy: DeprecationPolicy,
}

impl SchemaRegistry {
    pub fn load(
        store: impl SchemaStore + 'static,
        policy: DeprecationPolicy,
    ) -> Result<Self, SchemaError> {
        let document = store.load()?;
        let fingerprint = store.fingerprint();
        info!(
            schema_version = document.version,
            node_types = document.node_types.len(),
            relationship_types = document.relationship_types.len(),
            "schema registry loaded"
        );
        Ok(Self {
            snapshot: RwLock::new(Arc::new(document)),
            writer: Mutex::new(fingerprint),
            store: Box::new(store),
            policy,
        })
    }

    pub fn policy(&self) -> DeprecationPolicy {
        self.policy
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<SchemaDocument> {
        self.snapshot.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Look a key up among node types, then relationship types.
    pub fn resolve(&self, type_key: &str) -> Result<TypeDefinition, SchemaError> {
        self.snapshot()
            .find(type_key)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownType(type_key.to_string()))
    }

    /// Normalise `raw_key` for `kind` and look it up.
    pub fn resolve_kind(&self, kind: TypeKind, raw_key: &str) -> Result<TypeDefinition, SchemaError> {
        let key = normalize_type_key(kind, raw_key)?;
        self.snapshot()
            .get(kind, &key)
            .cloned()
            .ok_or(SchemaError::UnknownType(key))
    }

    /// Record a write to a type, creating it when unknown.
    pub fn register_or_touch<I, S>(
        &self,
        kind: TypeKind,
        raw_key: &str,
        observed_properties: I,
    ) -> Result<Touch, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_or_touch_at(kind, raw_key, observed_properties, Utc::now())
    }

    /// [`Self::register_or_touch`] with an explicit clock.
    pub fn register_or_touch_at<I, S>(
        &self,
        kind: TypeKind,
        raw_key: &str,
        observed_properties: I,
        now: DateTime<Utc>,
    ) -> Result<Touch, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = normalize_type_key(kind, raw_key)?;
        let observed: Vec<String> = observed_properties.into_iter().map(Into::into).collect();
        let policy = self.policy;

        let ((definition, created, warning), version) = self.commit(|doc, next_version| {
            let other = match kind {
                TypeKind::Node => TypeKind::Relationship,
                TypeKind::Relationship => TypeKind::Node,
            };
            if doc.get(other, &key).is_some() {
                return Err(SchemaError::KindMismatch {
                    key: key.clone(),
                    registered: other,
                    requested: kind,
                });
            }

            let types = doc.types_mut(kind);
            let mut warning = None;
            let created = match types.get_mut(&key) {
                Some(def) => {
                    if def.deprecated {
                        let err = SchemaError::DeprecatedTypeWrite {
                            key: key.clone(),
                            reason: def.deprecation_reason.clone().unwrap_or_default(),
                        };
                        if policy == DeprecationPolicy::Block {
                            return Err(err);
                        }
                        warning = Some(err);
                    }
                    def.usage_count += 1;
                    def.last_used = Some(now);
                    def.properties.extend(observed);
                    false
                }
                None => {
                    let mut def = TypeDefinition::new(kind, key.clone(), next_version);
                    def.usage_count = 1;
                    def.last_used = Some(now);
                    def.properties.extend(observed);
                    types.insert(key.clone(), def);
                    true
                }
            };
            let definition = types.get(&key).cloned().ok_or_else(|| {
                SchemaError::UnknownType(key.clone())
            })?;
            Ok(((definition, created, warning), true))
        })?;

        if created {
            info!(type_key = %definition.key, kind = %kind, schema_version = version, "schema type registered");
        } else {
            debug!(type_key = %definition.key, usage_count = definition.usage_count, schema_version = version, "schema type touched");
        }
        if let Some(w) = &warning {
            warn!(type_key = %definition.key, error = %w, "write to deprecated schema type");
        }

        Ok(Touch {
            definition,
            created,
            warning,
            version,
        })
    }

    /// Mark a type deprecated. It stays resolvable. The key is normalised
    /// like [`Self::register_or_touch`] does.
    pub fn deprecate(&self, type_key: &str, reason: &str) -> Result<TypeDefinition, SchemaError> {
        let (definition, version) = self.commit(|doc, _| {
            let (kind, key) = Self::known_key(doc, type_key)?;
            let def = doc
                .types_mut(kind)
                .get_mut(&key)
                .ok_or(SchemaError::UnknownType(key))?;
            let changed = !def.deprecated || def.deprecation_reason.as_deref() != Some(reason);
            def.deprecated = true;
            def.deprecation_reason = Some(reason.to_string());
            Ok((def.clone(), changed))
        })?;
        info!(type_key = %definition.key, reason, schema_version = version, "schema type deprecated");
        Ok(definition)
    }

    /// Set the structural category of a node type.
    pub fn set_category(
        &self,
        type_key: &str,
        category: TypeCategory,
    ) -> Result<TypeDefinition, SchemaError> {
        let (definition, _) = self.commit(|doc, _| {
            let def = doc
                .types_mut(TypeKind::Node)
                .get_mut(type_key)
                .ok_or_else(|| SchemaError::UnknownType(type_key.to_string()))?;
            let changed = def.category != Some(category);
            def.category = Some(category);
            Ok((def.clone(), changed))
        })?;
        Ok(definition)
    }

    /// Deprecate types that the document's usage rules consider unused.
    ///
    /// A type qualifies when its usage count is at most `rules.min_usage`
    /// and it has not been used for `rules.stale_after_days`. Returns the
    /// newly deprecated keys; the whole pass is one schema version.
    pub fn apply_usage_rules(&self, now: DateTime<Utc>) -> Result<Vec<String>, SchemaError> {
        let (deprecated, version) = self.commit(|doc, _| {
            let rules = doc.rules.clone();
            if rules.min_usage.is_none() && rules.stale_after_days.is_none() {
                return Ok((Vec::new(), false));
            }
            let mut deprecated = Vec::new();
            for kind in [TypeKind::Node, TypeKind::Relationship] {
                for (key, def) in doc.types_mut(kind).iter_mut() {
                    if def.deprecated {
                        continue;
                    }
                    let rarely_used = rules.min_usage.map_or(true, |m| def.usage_count <= m);
                    let stale = rules.stale_after_days.map_or(true, |days| {
                        def.last_used
                            .map_or(true, |used| used + Duration::days(days) < now)
                    });
                    if rarely_used && stale {
                        def.deprecated = true;
                        def.deprecation_reason = Some(format!(
                            "usage rule: {} use(s), last used {}",
                            def.usage_count,
                            def.last_used
                                .map(|d| d.date_naive().to_string())
                                .unwrap_or_else(|| "never".to_string())
                        ));
                        deprecated.push(key.clone());
                    }
                }
            }
            let changed = !deprecated.is_empty();
            Ok((deprecated, changed))
        })?;
        if !deprecated.is_empty() {
            info!(count = deprecated.len(), schema_version = version, "usage rules deprecated schema types");
        }
        Ok(deprecated)
    }

    /// Re-read the backing document and publish it if its types changed.
    pub fn reload(&self) -> Result<bool, SchemaError> {
        let mut fingerprint = self.writer.lock();
        self.reload_locked(&mut fingerprint)
    }

    /// [`Self::reload`], but only when the store reports a new fingerprint.
    pub fn reload_if_changed(&self) -> Result<bool, SchemaError> {
        let mut fingerprint = self.writer.lock();
        let current = self.store.fingerprint();
        if current.is_none() || current == *fingerprint {
            return Ok(false);
        }
        self.reload_locked(&mut fingerprint)
    }

    fn reload_locked(&self, fingerprint: &mut Option<SystemTime>) -> Result<bool, SchemaError> {
        let mut loaded = self.store.load()?;
        *fingerprint = self.store.fingerprint();

        let current = self.snapshot();
        let restored = restore_missing(&mut loaded, &current);
        if !restored.is_empty() {
            warn!(restored = ?restored, "schema document dropped type keys; keeping them");
        }
        if loaded.same_types(&current) {
            if !restored.is_empty() {
                self.store.save(&current)?;
                *fingerprint = self.store.fingerprint();
            }
            return Ok(false);
        }
        loaded.version = loaded.version.max(current.version + 1);
        let version = loaded.version;
        if !restored.is_empty() {
            self.store.save(&loaded)?;
            *fingerprint = self.store.fingerprint();
        }
        *self.snapshot.write() = Arc::new(loaded);
        info!(schema_version = version, "schema registry reloaded");
        Ok(true)
    }

    /// Normalise `raw_key` for whichever kind already holds it.
    fn known_key(doc: &SchemaDocument, raw_key: &str) -> Result<(TypeKind, String), SchemaError> {
        [TypeKind::Node, TypeKind::Relationship]
            .into_iter()
            .filter_map(|kind| normalize_type_key(kind, raw_key).ok().map(|key| (kind, key)))
            .find(|(kind, key)| doc.get(*kind, key).is_some())
            .ok_or_else(|| SchemaError::UnknownType(raw_key.to_string()))
    }

    /// Apply `f` to a copy of the current document under the writer lock.
    ///
    /// `f` gets the version the mutation will have and returns its output and
    /// whether anything changed. Unchanged documents are neither persisted
    /// nor versioned.
    fn commit<T>(
        &self,
        f: impl FnOnce(&mut SchemaDocument, u64) -> Result<(T, bool), SchemaError>,
    ) -> Result<(T, u64), SchemaError> {
        let mut fingerprint = self.writer.lock();
        let current = self.snapshot();
        let next_version = current.version + 1;

        let mut next = (*current).clone();
        let (out, changed) = f(&mut next, next_version)?;
        if !changed {
            return Ok((out, current.version));
        }

        next.version = next_version;
        next.last_updated = Some(Utc::now());
        self.store.save(&next)?;
        *fingerprint = self.store.fingerprint();
        *self.snapshot.write() = Arc::new(next);
        Ok((out, next_version))
    }
}

/// Copy every type `current` knows and `loaded` lacks into `loaded`.
/// Type keys are never deleted, so a hand edit cannot remove one.
fn restore_missing(loaded: &mut SchemaDocument, current: &SchemaDocument) -> Vec<String> {
    let mut restored = Vec::new();
    for kind in [TypeKind::Node, TypeKind::Relationship] {
        for (key, def) in current.types(kind) {
            if loaded.find(key).is_none() {
                loaded.types_mut(kind).insert(key.clone(), def.clone());
                restored.push(key.clone());
            }
        }
    }
    restored
}
