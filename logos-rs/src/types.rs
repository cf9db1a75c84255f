//! Process configuration and knowledgebase document loading.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::LogosError;
use crate::memory::MemoryRules;
use crate::pipeline::RetryPolicy;
use crate::resolver::ResolverConfig;
use crate::schema::DeprecationPolicy;
use crate::upsert::UpsertConfig;

fn validate_actor(actor: &str) -> Result<(), validator::ValidationError> {
    if actor.chars().any(char::is_whitespace) {
        return Err(validator::ValidationError::new("actor must not contain whitespace"));
    }
    Ok(())
}

/// Central configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogosConfig {
    /// Directory holding `schema.yml`, `pipelines.yml` and `rules/`.
    #[validate(length(min = 1))]
    pub kb_dir: String,

    /// Recorded as `created_by` / `updated_by` on graph writes.
    #[validate(length(min = 1), custom(function = "validate_actor"))]
    pub actor: String,

    /// Register unknown types on write.
    pub schema_growth: bool,

    /// What to do with writes to deprecated types.
    pub deprecated_writes: DeprecationPolicy,

    #[validate(range(min = 1, max = 20))]
    pub stage_max_attempts: u32,

    #[validate(range(min = 1))]
    pub stage_backoff_ms: u64,

    /// Per-run deadline; `None` means no deadline.
    #[validate(range(min = 1))]
    pub run_deadline_secs: Option<u64>,

    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

impl Default for LogosConfig {
    fn default() -> Self {
        Self {
            kb_dir: "knowledgebase".to_string(),
            actor: "logos".to_string(),
            schema_growth: true,
            deprecated_writes: DeprecationPolicy::Warn,
            stage_max_attempts: 3,
            stage_backoff_ms: 200,
            run_deadline_secs: None,
            sweep_interval_secs: 300,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> crate::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            LogosError::Validation(format!("{name} has an invalid value '{raw}'"))
        }),
        _ => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> crate::Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(LogosError::Validation(format!(
                "{name} must be a boolean, got '{raw}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

impl LogosConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` first (non-fatal if `.env` is absent).
    /// Every variable is optional; malformed values return
    /// [`LogosError::Validation`] naming the variable.
    pub fn from_env() -> crate::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let kb_dir = std::env::var("LOGOS_KB_DIR").unwrap_or(defaults.kb_dir);
        let actor = std::env::var("LOGOS_ACTOR").unwrap_or(defaults.actor);
        let schema_growth = env_flag("LOGOS_SCHEMA_GROWTH", defaults.schema_growth)?;
        let deprecated_writes = match std::env::var("LOGOS_DEPRECATED_WRITES") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse::<DeprecationPolicy>()
                .map_err(|e| LogosError::Validation(format!("LOGOS_DEPRECATED_WRITES: {e}")))?,
            _ => defaults.deprecated_writes,
        };
        let stage_max_attempts = env_or("LOGOS_STAGE_MAX_ATTEMPTS", defaults.stage_max_attempts)?;
        let stage_backoff_ms = env_or("LOGOS_STAGE_BACKOFF_MS", defaults.stage_backoff_ms)?;
        let run_deadline_secs = match std::env::var("LOGOS_RUN_DEADLINE_SECS") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|_| {
                LogosError::Validation(format!(
                    "LOGOS_RUN_DEADLINE_SECS must be a positive integer, got '{raw}'"
                ))
            })?),
            _ => None,
        };
        let sweep_interval_secs =
            env_or("LOGOS_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?;

        let config = Self {
            kb_dir,
            actor,
            schema_growth,
            deprecated_writes,
            stage_max_attempts,
            stage_backoff_ms,
            run_deadline_secs,
            sweep_interval_secs,
        };

        config
            .validate()
            .map_err(|e| LogosError::Validation(e.to_string()))?;

        Ok(config)
    }

    pub fn kb_path(&self) -> &Path {
        Path::new(&self.kb_dir)
    }

    pub fn schema_path(&self) -> PathBuf {
        self.kb_path().join("schema.yml")
    }

    pub fn pipelines_path(&self) -> PathBuf {
        self.kb_path().join("pipelines.yml")
    }

    pub fn resolution_rules_path(&self) -> PathBuf {
        self.kb_path().join("rules").join("resolution.yml")
    }

    pub fn memory_rules_path(&self) -> PathBuf {
        self.kb_path().join("rules").join("memory.yml")
    }

    pub fn load_resolver_config(&self) -> crate::Result<ResolverConfig> {
        let config: ResolverConfig = load_yaml(&self.resolution_rules_path())?;
        config
            .validate()
            .map_err(|e| LogosError::Validation(format!("resolution rules: {e}")))?;
        Ok(config)
    }

    pub fn load_memory_rules(&self) -> crate::Result<MemoryRules> {
        let rules: MemoryRules = load_yaml(&self.memory_rules_path())?;
        rules
            .validate()
            .map_err(|e| LogosError::Validation(format!("memory rules: {e}")))?;
        Ok(rules)
    }

    pub fn upsert_config(&self) -> UpsertConfig {
        UpsertConfig {
            allow_schema_growth: self.schema_growth,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.stage_max_attempts,
            initial_backoff: Duration::from_millis(self.stage_backoff_ms),
            max_backoff: Duration::from_millis(self.stage_backoff_ms.saturating_mul(20)),
        }
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse a YAML document; a missing or empty file yields `T::default()`.
pub fn load_yaml<T: DeserializeOwned + Default>(path: &Path) -> crate::Result<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(LogosError::io(path.display(), e)),
    };
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_str(&raw)?)
}
