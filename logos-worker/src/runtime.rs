//! Wiring of the core services from a knowledgebase directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use logos_rs::bundles::{Bundle, BundlePayload, ConsolidationRequest, InteractionMeta, RawInput};
use logos_rs::driver::{GraphCandidateProvider, GraphSnapshot, GraphStore, InMemoryGraphStore};
use logos_rs::extract::JsonExtractor;
use logos_rs::memory::MemoryTierManager;
use logos_rs::pipeline::stages::builtin_registry;
use logos_rs::pipeline::{
    PipelineCatalog, PipelineContext, PipelineExecutor, PipelineRun, Services, Workflow,
};
use logos_rs::resolver::EntityResolver;
use logos_rs::schema::{SchemaRegistry, YamlSchemaStore};
use logos_rs::upsert::UpsertEngine;
use tracing::{info, warn};

use crate::config::WorkerConfig;

/// Everything a worker process holds for its lifetime.
pub struct Runtime {
    config: WorkerConfig,
    services: Arc<Services>,
    store: Arc<InMemoryGraphStore>,
    executor: PipelineExecutor,
}

impl Runtime {
    /// Load the schema, rules, pipelines and graph snapshot, and validate
    /// the pipeline catalog.
    pub fn bootstrap(config: WorkerConfig) -> anyhow::Result<Self> {
        let logos = &config.logos;
        let schema = Arc::new(
            SchemaRegistry::load(
                YamlSchemaStore::new(logos.schema_path()),
                logos.deprecated_writes,
            )
            .with_context(|| format!("loading {}", logos.schema_path().display()))?,
        );
        let memory = Arc::new(MemoryTierManager::new(logos.load_memory_rules()?));
        let resolver = EntityResolver::new(logos.load_resolver_config()?);
        let store = Arc::new(load_snapshot(&config.graph_snapshot)?);

        let services = Arc::new(Services {
            schema: schema.clone(),
            memory,
            resolver,
            candidates: Arc::new(GraphCandidateProvider::new(store.clone())),
            extractor: Arc::new(JsonExtractor),
            upserts: Arc::new(UpsertEngine::new(
                schema.clone(),
                store.clone(),
                logos.upsert_config(),
            )),
        });

        let catalog = PipelineCatalog::load(&logos.pipelines_path())?;
        let executor = PipelineExecutor::new(
            services.clone(),
            builtin_registry(),
            catalog,
            logos.retry_policy(),
        )?;

        info!(
            kb = %logos.kb_path().display(),
            schema_version = schema.version(),
            nodes = store.node_count(),
            edges = store.edge_count(),
            "runtime ready"
        );
        Ok(Self {
            config,
            services,
            store,
            executor,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn store(&self) -> &Arc<InMemoryGraphStore> {
        &self.store
    }

    /// The bundle the configured workflow starts from.
    ///
    /// `consolidation` starts from a fresh request. A `.json` input is read
    /// as a serialized bundle; any other file becomes raw input whose
    /// interaction id is the file stem.
    pub fn initial_bundle(&self) -> anyhow::Result<Bundle> {
        if self.config.workflow == Workflow::Consolidation {
            return Ok(Bundle::new(
                InteractionMeta::new(format!("consolidation-{}", chrono::Utc::now().timestamp())),
                BundlePayload::Consolidation(ConsolidationRequest::now()),
            ));
        }

        let input = self
            .config
            .input
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no input configured"))?;
        if input.extension().and_then(|e| e.to_str()) == Some("json") {
            let raw = std::fs::read_to_string(input)
                .with_context(|| format!("reading {}", input.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a bundle", input.display()));
        }
        if self.config.workflow == Workflow::Commit {
            anyhow::bail!("the commit workflow needs a preview bundle (.json) as input");
        }

        let interaction_id = input
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cannot derive an interaction id from {}", input.display()))?;
        let mut meta = InteractionMeta::new(interaction_id);
        meta.source_uri = Some(input.display().to_string());
        meta.created_by = Some(self.config.logos.actor.clone());
        Ok(Bundle::new(
            meta,
            BundlePayload::RawInput(RawInput {
                file_path: Some(input.display().to_string()),
                ..Default::default()
            }),
        ))
    }

    /// Fail early when the graph store does not answer.
    pub async fn check_store(&self) -> anyhow::Result<()> {
        self.store.ping().await.context("graph store health check")?;
        Ok(())
    }

    /// Run the configured workflow once and persist the graph.
    pub async fn run_once(&self) -> anyhow::Result<PipelineRun> {
        self.check_store().await?;
        let bundle = self.initial_bundle()?;
        let mut ctx = PipelineContext::new(self.config.logos.actor.clone());
        if let Some(deadline) = self.config.logos.run_deadline() {
            ctx = ctx.with_timeout(deadline);
        }

        let outcome = self
            .executor
            .run_workflow(self.config.workflow, bundle, ctx)
            .await;
        self.save_snapshot()?;

        let run = outcome.map_err(|failure| {
            warn!(
                run_id = %failure.log.run_id,
                stages = failure.log.stages.len(),
                discarded = failure.discarded.len(),
                "workflow failed"
            );
            anyhow::Error::new(failure)
        })?;
        self.write_output(&run)?;
        Ok(run)
    }

    /// Pick up edits to `schema.yml` and `rules/memory.yml`.
    pub fn reload(&self) -> anyhow::Result<()> {
        if self.services.schema.reload_if_changed()? {
            info!(schema_version = self.services.schema.version(), "schema reloaded");
        }
        let rules = self.config.logos.load_memory_rules()?;
        if rules != self.services.memory.rules() {
            self.services.memory.set_rules(rules);
            info!("memory rules reloaded");
        }
        Ok(())
    }

    /// Write the graph to the snapshot file via a temp file and rename.
    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        let path = &self.config.graph_snapshot;
        let json = serde_json::to_string_pretty(&self.store.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = tmp_path(path);
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn write_output(&self, run: &PipelineRun) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&run.bundle)?;
        match &self.config.output {
            Some(path) => {
                std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> anyhow::Result<InMemoryGraphStore> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(InMemoryGraphStore::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let snapshot: GraphSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a graph snapshot", path.display()))?;
    Ok(InMemoryGraphStore::from_snapshot(snapshot))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
