use std::path::PathBuf;

use logos_rs::pipeline::Workflow;
use logos_rs::LogosConfig;

/// How long the worker stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run the configured workflow once and exit.
    Once,
    /// Keep the decay sweeper and hot reload running until a shutdown signal.
    Daemon,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Core settings (`LOGOS_KB_DIR`, `LOGOS_ACTOR`, ...).
    pub logos: LogosConfig,
    /// Workflow to run. Env: `LOGOS_WORKFLOW`, default `ingest`.
    pub workflow: Workflow,
    /// Interaction document, or a bundle JSON file for `commit`. Env: `LOGOS_INPUT`.
    pub input: Option<PathBuf>,
    /// Where the result bundle is written; stdout when unset. Env: `LOGOS_OUTPUT`.
    pub output: Option<PathBuf>,
    /// Graph snapshot loaded at start and saved after each run.
    /// Env: `LOGOS_GRAPH_SNAPSHOT`, default `<kb>/graph.json`.
    pub graph_snapshot: PathBuf,
    /// Env: `LOGOS_MODE` (`once` | `daemon`), default `once`.
    pub mode: Mode,
    /// How often the daemon checks the knowledgebase for edits.
    /// Env: `LOGOS_RELOAD_INTERVAL_SECS`, default 30.
    pub reload_interval_secs: u64,
}

impl WorkerConfig {
    /// Load configuration from environment variables, applying defaults.
    ///
    /// # Errors
    /// Returns an error if the core configuration is invalid, if
    /// `LOGOS_WORKFLOW` or `LOGOS_MODE` name something unknown, or if a
    /// workflow that needs input has none.
    pub fn from_env() -> anyhow::Result<Self> {
        let logos = LogosConfig::from_env()?;

        let workflow = match std::env::var("LOGOS_WORKFLOW") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse::<Workflow>()
                .map_err(|e| anyhow::anyhow!("Invalid LOGOS_WORKFLOW: {}", e))?,
            _ => Workflow::Ingest,
        };

        let mode = match std::env::var("LOGOS_MODE")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "" | "once" => Mode::Once,
            "daemon" => Mode::Daemon,
            other => anyhow::bail!("Invalid LOGOS_MODE '{}': expected once or daemon", other),
        };

        let input = non_empty_path("LOGOS_INPUT");
        let output = non_empty_path("LOGOS_OUTPUT");
        let graph_snapshot = non_empty_path("LOGOS_GRAPH_SNAPSHOT")
            .unwrap_or_else(|| logos.kb_path().join("graph.json"));
        let reload_interval_secs = parse_env_u64("LOGOS_RELOAD_INTERVAL_SECS", 30)?;
        if reload_interval_secs == 0 {
            anyhow::bail!("LOGOS_RELOAD_INTERVAL_SECS must be at least 1");
        }

        let config = WorkerConfig {
            logos,
            workflow,
            input,
            output,
            graph_snapshot,
            mode,
            reload_interval_secs,
        };
        config.check_input()?;
        Ok(config)
    }

    /// Every workflow but consolidation starts from a document in a one-shot run.
    fn check_input(&self) -> anyhow::Result<()> {
        if self.mode == Mode::Once
            && self.workflow != Workflow::Consolidation
            && self.input.is_none()
        {
            anyhow::bail!("LOGOS_INPUT is required for the {} workflow", self.workflow);
        }
        Ok(())
    }
}

fn non_empty_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
