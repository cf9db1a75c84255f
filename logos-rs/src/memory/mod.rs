//! Multi-tier memory: short-term scratch, a decaying mid-term cache, and
//! durable long-term artifacts.
//!
//! Only long-term artifacts may be written to the graph. Promotion to
//! long-term happens on a strength or importance threshold crossing, or on
//! explicit confirmation, and is recorded in the transition audit log.

pub mod manager;
pub mod rules;
pub mod sweeper;

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use manager::MemoryTierManager;
pub use rules::{LongTermRules, MemoryRules, MidTermRules, ShortTermRules};
pub use sweeper::spawn_decay_sweeper;

/// Retention tier of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    MidTerm,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::MidTerm => "mid_term",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier plus decay metadata for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMarker {
    pub artifact_id: String,
    pub tier: MemoryTier,
    pub strength: f64,
    pub importance: f64,
    pub last_used: DateTime<Utc>,
    /// Point from which pending decay is measured.
    pub decayed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    /// Held for a reviewer; only a confirmation moves it to long-term.
    #[serde(default)]
    pub awaiting_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_run: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
}

impl TierMarker {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Bring `strength` up to date with exponential half-life decay.
    /// Pinned markers and non-positive half-lives are left alone.
    pub(crate) fn apply_decay(&mut self, now: DateTime<Utc>, half_life_secs: f64) {
        if self.pinned || half_life_secs <= 0.0 {
            return;
        }
        let elapsed = (now - self.decayed_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return;
        }
        self.strength *= 0.5_f64.powf(elapsed / half_life_secs);
        self.decayed_at = now;
    }

    pub(crate) fn refresh_ttl(&mut self, ttl_secs: Option<i64>, now: DateTime<Utc>) {
        self.ttl_secs = ttl_secs;
        self.expires_at = ttl_secs.map(|secs| now + Duration::seconds(secs));
    }
}

/// An artifact held by the tier manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryArtifact {
    pub marker: TierMarker,
    #[serde(default)]
    pub payload: Value,
}

/// What the caller knows about an artifact when tagging it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSignal {
    pub artifact_id: String,
    #[serde(default)]
    pub importance: f64,
    #[serde(default)]
    pub confidence: f64,
    /// Waiting for a reviewer. Blocks long-term until `user_confirmed`.
    #[serde(default)]
    pub pending_review: bool,
    /// Must survive past the current run.
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub user_confirmed: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub payload: Value,
}

impl ArtifactSignal {
    pub fn new(artifact_id: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            ..Default::default()
        }
    }
}

/// Kind of tier action, as recorded in run logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierAction {
    Tagged,
    Reinforced,
    Promoted,
    Demoted,
    Evicted,
    Discarded,
    Pinned,
    Unpinned,
}

/// A tier action taken by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAction {
    pub artifact_id: String,
    pub action: TierAction,
    /// Tier after the action; `None` once the artifact is gone.
    pub tier: Option<MemoryTier>,
}

/// Audit record of a tier change. `None` means "not held".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTransition {
    pub artifact_id: String,
    pub from: Option<MemoryTier>,
    pub to: Option<MemoryTier>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Result of one decay sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub swept_at: DateTime<Utc>,
    pub decayed: usize,
    #[serde(default)]
    pub demoted: Vec<String>,
    #[serde(default)]
    pub evicted: Vec<String>,
}
