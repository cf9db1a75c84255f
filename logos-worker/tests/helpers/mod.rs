use std::path::PathBuf;

use logos_rs::pipeline::Workflow;
use logos_rs::LogosConfig;
use logos_worker::{Mode, WorkerConfig};
use tempfile::TempDir;

/// Temporary knowledgebase directory with helpers for building integration tests.
pub struct TempKnowledgebase {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TempKnowledgebase {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp kb dir");
        let path = dir.path().to_path_buf();
        Self { dir, path }
    }

    /// Write a file relative to the knowledgebase root.
    pub fn write(&self, rel: &str, content: &str) -> &Self {
        let full = self.path.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&full, content).expect("write test file");
        self
    }

    /// Worker configuration rooted at this knowledgebase.
    pub fn config(&self, workflow: Workflow, input: Option<&str>) -> WorkerConfig {
        let logos = LogosConfig {
            kb_dir: self.path.display().to_string(),
            actor: "tester".to_string(),
            ..LogosConfig::default()
        };
        WorkerConfig {
            logos,
            workflow,
            input: input.map(|rel| self.path.join(rel)),
            output: Some(self.path.join("out.json")),
            graph_snapshot: self.path.join("graph.json"),
            mode: Mode::Once,
            reload_interval_secs: 30,
        }
    }
}
