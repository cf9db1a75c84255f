//! Pipeline executor.
//!
//! A pipeline is an ordered list of [`Stage`]s over typed bundles. The
//! executor runs the stages of one run strictly in sequence:
//! 1. **Contract check**: the incoming bundle kind must match the stage input
//! 2. **Run with retry**: `Recoverable` failures are retried with exponential
//!    backoff up to [`RetryPolicy::max_attempts`]; exhaustion becomes fatal
//! 3. **Deadline**: when the run deadline passes, remaining stages are
//!    skipped and the run's short/mid-term artifacts are discarded
//! 4. **Record**: bundle ids, schema versions and memory actions per stage
//!    go into the [`RunLog`]

pub mod registry;
pub mod stage;
pub mod stages;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bundles::Bundle;
use crate::errors::{LogosError, StageError};
use crate::extract::Extractor;
use crate::memory::{MemoryAction, MemoryTierManager};
use crate::resolver::{CandidateProvider, EntityResolver};
use crate::schema::SchemaRegistry;
use crate::upsert::UpsertEngine;

pub use registry::{PipelineCatalog, PipelineDefinition, StageRegistry, Workflow};
pub use stage::{Stage, StageContext};

/// Shared collaborators available to every stage.
pub struct Services {
    pub schema: Arc<SchemaRegistry>,
    pub memory: Arc<MemoryTierManager>,
    pub resolver: EntityResolver,
    pub candidates: Arc<dyn CandidateProvider>,
    pub extractor: Arc<dyn Extractor>,
    pub upserts: Arc<UpsertEngine>,
}

/// Bounded retry for recoverable stage failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(4),
        }
    }
}

/// Caller-supplied settings for one run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub actor: String,
    pub deadline: Option<Instant>,
    /// Free-form context, e.g. `organization` or `project` hints for
    /// resolution, or `query` for reasoning.
    pub attributes: BTreeMap<String, String>,
}

impl PipelineContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            deadline: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    DeadlineExceeded,
}

/// What happened in one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_id: String,
    pub input_bundle_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bundle_id: Option<Uuid>,
    pub schema_version_before: u64,
    pub schema_version_after: u64,
    #[serde(default)]
    pub memory_actions: Vec<MemoryAction>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audit trail of a run, up to its last executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

impl RunLog {
    fn new(run_id: Uuid, pipeline_id: &str) -> Self {
        Self {
            run_id,
            pipeline_id: pipeline_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            stages: Vec::new(),
        }
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub bundle: Bundle,
    pub log: RunLog,
}

/// A run that stopped early.
#[derive(Debug, thiserror::Error)]
#[error("pipeline '{}' failed: {error}", .log.pipeline_id)]
pub struct PipelineFailure {
    #[source]
    pub error: LogosError,
    pub log: RunLog,
    /// Output of the last stage that succeeded (or the initial bundle).
    pub last_bundle: Bundle,
    /// Artifacts dropped because the deadline expired.
    pub discarded: Vec<String>,
}

/// Runs pipelines from a validated catalog.
pub struct PipelineExecutor {
    services: Arc<Services>,
    stages: StageRegistry,
    catalog: PipelineCatalog,
    retry: RetryPolicy,
}

impl PipelineExecutor {
    /// Build an executor; fails if the catalog does not validate against
    /// `stages`.
    pub fn new(
        services: Arc<Services>,
        stages: StageRegistry,
        catalog: PipelineCatalog,
        retry: RetryPolicy,
    ) -> Result<Self, LogosError> {
        for warning in catalog.validate(&stages)? {
            warn!("{warning}");
        }
        info!(
            pipelines = catalog.pipelines.len(),
            stages = stages.len(),
            "pipeline catalog validated"
        );
        Ok(Self {
            services,
            stages,
            catalog,
            retry,
        })
    }

    /// Executor over the built-in stages and workflows.
    pub fn builtin(services: Arc<Services>, retry: RetryPolicy) -> Result<Self, LogosError> {
        Self::new(
            services,
            stages::builtin_registry(),
            PipelineCatalog::builtin(),
            retry,
        )
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    /// Run the pipeline bound to `workflow`.
    pub async fn run_workflow(
        &self,
        workflow: Workflow,
        bundle: Bundle,
        ctx: PipelineContext,
    ) -> Result<PipelineRun, PipelineFailure> {
        let pipeline_id = match self.catalog.for_workflow(workflow) {
            Some(def) => def.id.clone(),
            None => workflow.to_string(),
        };
        self.run(&pipeline_id, bundle, ctx).await
    }

    pub async fn run(
        &self,
        pipeline_id: &str,
        bundle: Bundle,
        ctx: PipelineContext,
    ) -> Result<PipelineRun, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let mut log = RunLog::new(run_id, pipeline_id);

        let Some(definition) = self.catalog.get(pipeline_id) else {
            log.finish(RunStatus::Failed);
            return Err(PipelineFailure {
                error: LogosError::UnknownPipeline(pipeline_id.to_string()),
                log,
                last_bundle: bundle,
                discarded: Vec::new(),
            });
        };

        info!(%run_id, pipeline_id, bundle_id = %bundle.id, "pipeline run started");
        let sctx = StageContext::new(
            self.services.clone(),
            run_id,
            pipeline_id,
            ctx.actor.clone(),
            ctx.attributes.clone(),
        );
        let mut current = bundle;

        for stage_id in &definition.stages {
            let Some(stage) = self.stages.get(stage_id) else {
                let error =
                    LogosError::PipelineConfig(format!("stage '{stage_id}' is not registered"));
                return Err(self.fail(log, RunStatus::Failed, error, current, Vec::new()));
            };

            if current.kind() != stage.input() {
                let error = LogosError::StageTypeMismatch {
                    stage_id: stage_id.clone(),
                    expected: stage.input(),
                    found: current.kind(),
                };
                return Err(self.fail(log, RunStatus::Failed, error, current, Vec::new()));
            }

            let schema_version_before = self.services.schema.version();
            let started = Instant::now();
            let attempts = AtomicU32::new(0);

            let outcome = match ctx.deadline {
                Some(deadline) if Instant::now() >= deadline => None,
                Some(deadline) => tokio::time::timeout_at(
                    deadline,
                    self.run_stage(stage.as_ref(), &current, &sctx, &attempts),
                )
                .await
                .ok(),
                None => Some(self.run_stage(stage.as_ref(), &current, &sctx, &attempts).await),
            };

            let mut record = StageRecord {
                stage_id: stage_id.clone(),
                input_bundle_id: current.id,
                output_bundle_id: None,
                schema_version_before,
                schema_version_after: self.services.schema.version(),
                memory_actions: sctx.take_actions(),
                attempts: attempts.load(Ordering::SeqCst),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            };

            match outcome {
                None => {
                    let discarded = self.services.memory.discard_run(run_id, Utc::now());
                    record.error = Some("deadline exceeded".to_string());
                    log.stages.push(record);
                    warn!(%run_id, stage_id = %stage_id, discarded = discarded.len(), "run deadline exceeded");
                    let error = LogosError::DeadlineExceeded {
                        stage_id: stage_id.clone(),
                    };
                    return Err(self.fail(log, RunStatus::DeadlineExceeded, error, current, discarded));
                }
                Some(Err(source)) => {
                    record.error = Some(source.to_string());
                    let attempts = record.attempts;
                    log.stages.push(record);
                    let error = LogosError::Stage {
                        stage_id: stage_id.clone(),
                        attempts,
                        source,
                    };
                    return Err(self.fail(log, RunStatus::Failed, error, current, Vec::new()));
                }
                Some(Ok(next)) if next.kind() != stage.output() => {
                    record.error = Some(format!("produced a {} bundle", next.kind()));
                    log.stages.push(record);
                    let error = LogosError::StageTypeMismatch {
                        stage_id: stage_id.clone(),
                        expected: stage.output(),
                        found: next.kind(),
                    };
                    return Err(self.fail(log, RunStatus::Failed, error, current, Vec::new()));
                }
                Some(Ok(next)) => {
                    record.output_bundle_id = Some(next.id);
                    info!(
                        %run_id,
                        stage_id = %stage_id,
                        bundle_id = %current.id,
                        output_bundle_id = %next.id,
                        schema_version = record.schema_version_after,
                        memory_actions = record.memory_actions.len(),
                        attempts = record.attempts,
                        duration_ms = record.duration_ms,
                        "stage completed"
                    );
                    log.stages.push(record);
                    current = next;
                }
            }
        }

        log.finish(RunStatus::Succeeded);
        info!(%run_id, pipeline_id, stages = log.stages.len(), "pipeline run succeeded");
        Ok(PipelineRun {
            bundle: current,
            log,
        })
    }

    /// One stage with bounded retry of recoverable failures.
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        input: &Bundle,
        ctx: &StageContext,
        attempts: &AtomicU32,
    ) -> Result<Bundle, StageError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_backoff)
            .with_max_interval(self.retry.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        let op = move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match stage.run(input, ctx).await {
                Ok(bundle) => Ok(bundle),
                Err(e @ StageError::Recoverable(_)) if attempt < max_attempts => {
                    warn!(stage_id = stage.id(), attempt, error = %e, "recoverable stage failure; retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };

        backoff::future::retry(policy, op).await.map_err(|e| match e {
            StageError::Recoverable(msg) => {
                StageError::Fatal(format!("retries exhausted after {max_attempts} attempt(s): {msg}"))
            }
            fatal => fatal,
        })
    }

    fn fail(
        &self,
        mut log: RunLog,
        status: RunStatus,
        error: LogosError,
        last_bundle: Bundle,
        discarded: Vec<String>,
    ) -> PipelineFailure {
        log.finish(status);
        error!(run_id = %log.run_id, pipeline_id = %log.pipeline_id, error = %error, "pipeline run failed");
        PipelineFailure {
            error,
            log,
            last_bundle,
            discarded,
        }
    }
}
