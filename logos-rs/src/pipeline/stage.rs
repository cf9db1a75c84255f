//! The stage contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::Services;
use crate::bundles::{Bundle, BundleKind};
use crate::errors::StageError;
use crate::memory::MemoryAction;

/// One step of a pipeline: consumes a bundle of kind [`Stage::input`] and
/// produces a new bundle of kind [`Stage::output`].
///
/// A stage may be retried after a [`StageError::Recoverable`] failure, so
/// side effects must be safe to repeat.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Dotted identifier used in pipeline definitions, e.g. `nlp.extract`.
    fn id(&self) -> &'static str;

    fn input(&self) -> BundleKind;

    fn output(&self) -> BundleKind;

    async fn run(&self, bundle: &Bundle, ctx: &StageContext) -> Result<Bundle, StageError>;
}

/// Per-run state handed to every stage.
pub struct StageContext {
    pub services: Arc<Services>,
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub actor: String,
    pub attributes: BTreeMap<String, String>,
    actions: Mutex<Vec<MemoryAction>>,
}

impl StageContext {
    pub fn new(
        services: Arc<Services>,
        run_id: Uuid,
        pipeline_id: impl Into<String>,
        actor: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            services,
            run_id,
            pipeline_id: pipeline_id.into(),
            actor: actor.into(),
            attributes,
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Record a memory-tier action for the run log.
    pub fn record(&self, action: MemoryAction) {
        self.actions.lock().push(action);
    }

    pub(crate) fn take_actions(&self) -> Vec<MemoryAction> {
        std::mem::take(&mut *self.actions.lock())
    }
}
