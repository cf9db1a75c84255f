//! Stage registry, pipeline catalog and the startup consistency check.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::stage::Stage;
use crate::errors::LogosError;

/// Every stage the process knows, by id.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<&'static str, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<(), LogosError> {
        let id = stage.id();
        if self.stages.contains_key(id) {
            return Err(LogosError::PipelineConfig(format!(
                "stage '{id}' registered twice"
            )));
        }
        self.stages.insert(id, stage);
        Ok(())
    }

    /// Builder form of [`Self::register`]; a stage with the same id is
    /// replaced.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stages.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Entry points that trigger a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Ingest,
    Commit,
    Consolidation,
    Reasoning,
}

impl Workflow {
    pub const ALL: [Workflow; 4] = [
        Workflow::Ingest,
        Workflow::Commit,
        Workflow::Consolidation,
        Workflow::Reasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Ingest => "ingest",
            Workflow::Commit => "commit",
            Workflow::Consolidation => "consolidation",
            Workflow::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workflow::ALL
            .into_iter()
            .find(|w| w.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown workflow '{s}'"))
    }
}

/// A named, ordered list of stage ids bound to one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub workflow: Workflow,
    pub stages: Vec<String>,
}

/// Declared pipelines, loaded from `pipelines.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCatalog {
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
}

impl PipelineCatalog {
    pub fn from_yaml(raw: &str) -> Result<Self, LogosError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load from a file; a missing or empty file yields [`Self::builtin`].
    pub fn load(path: &Path) -> Result<Self, LogosError> {
        let catalog: PipelineCatalog = crate::types::load_yaml(path)?;
        if catalog.pipelines.is_empty() {
            return Ok(Self::builtin());
        }
        Ok(catalog)
    }

    /// The four standard workflows over the built-in stages.
    pub fn builtin() -> Self {
        let def = |id: &str, workflow, stages: &[&str]| PipelineDefinition {
            id: id.to_string(),
            workflow,
            stages: stages.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            pipelines: vec![
                def(
                    "ingest",
                    Workflow::Ingest,
                    &[
                        "ingest.validate_input",
                        "ingest.parse",
                        "nlp.extract",
                        "normalise.resolve_entities",
                        "memory.tag",
                        "preview.assemble",
                    ],
                ),
                def(
                    "commit",
                    Workflow::Commit,
                    &[
                        "commit.apply_annotations",
                        "memory.tag",
                        "graph.build_upserts",
                        "graph.upsert",
                    ],
                ),
                def(
                    "consolidation",
                    Workflow::Consolidation,
                    &["memory.decay_sweep", "memory.promote", "graph.upsert"],
                ),
                def(
                    "reasoning",
                    Workflow::Reasoning,
                    &[
                        "ingest.validate_input",
                        "ingest.parse",
                        "nlp.extract",
                        "normalise.resolve_entities",
                        "reasoning.recall",
                    ],
                ),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    pub fn for_workflow(&self, workflow: Workflow) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.workflow == workflow)
    }

    /// Startup consistency check against the registered stages.
    ///
    /// Errors: duplicate pipeline ids, a workflow bound to more than one
    /// pipeline, empty pipelines, unknown stage ids, and adjacent stages
    /// whose output and input kinds differ. Registered stages that no
    /// pipeline uses are returned as warnings.
    pub fn validate(&self, registry: &StageRegistry) -> Result<Vec<String>, LogosError> {
        let mut ids = BTreeSet::new();
        let mut bound: BTreeMap<Workflow, &str> = BTreeMap::new();
        let mut used = BTreeSet::new();

        for pipeline in &self.pipelines {
            if !ids.insert(pipeline.id.as_str()) {
                return Err(config_error(format!(
                    "pipeline '{}' declared twice",
                    pipeline.id
                )));
            }
            if let Some(other) = bound.insert(pipeline.workflow, &pipeline.id) {
                return Err(config_error(format!(
                    "workflow '{}' is bound to both '{other}' and '{}'",
                    pipeline.workflow, pipeline.id
                )));
            }
            if pipeline.stages.is_empty() {
                return Err(config_error(format!("pipeline '{}' has no stages", pipeline.id)));
            }

            let mut previous: Option<Arc<dyn Stage>> = None;
            for stage_id in &pipeline.stages {
                let stage = registry.get(stage_id).ok_or_else(|| {
                    config_error(format!(
                        "pipeline '{}' references unknown stage '{stage_id}'",
                        pipeline.id
                    ))
                })?;
                if let Some(prev) = &previous {
                    if prev.output() != stage.input() {
                        return Err(config_error(format!(
                            "pipeline '{}': '{}' produces {} but '{}' expects {}",
                            pipeline.id,
                            prev.id(),
                            prev.output(),
                            stage.id(),
                            stage.input()
                        )));
                    }
                }
                used.insert(stage.id());
                previous = Some(stage);
            }
        }

        Ok(registry
            .ids()
            .filter(|id| !used.contains(id))
            .map(|id| format!("stage '{id}' is registered but not used by any pipeline"))
            .collect())
    }
}

fn config_error(msg: String) -> LogosError {
    LogosError::PipelineConfig(msg)
}
