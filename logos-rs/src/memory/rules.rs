//! Decay and promotion parameters, loaded from `rules/memory.yml`.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ShortTermRules {
    #[validate(range(min = 1))]
    pub default_ttl_secs: i64,
    /// Oldest short-term artifacts of a run are dropped beyond this count.
    #[validate(range(min = 1))]
    pub max_items_per_run: usize,
}

impl Default for ShortTermRules {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60 * 60,
            max_items_per_run: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MidTermRules {
    #[validate(range(min = 1))]
    pub default_ttl_secs: i64,
    #[validate(range(min = 1.0))]
    pub half_life_secs: f64,
    #[validate(range(min = 0.0))]
    pub initial_strength: f64,
    #[validate(range(min = 0.0))]
    pub reinforcement: f64,
    /// Unpinned artifacts decayed below this are evicted.
    #[validate(range(min = 0.0))]
    pub eviction_floor: f64,
    #[validate(range(min = 0.0))]
    pub promotion_strength: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub promotion_importance: f64,
}

impl Default for MidTermRules {
    fn default() -> Self {
        Self {
            default_ttl_secs: 14 * 24 * 60 * 60,
            half_life_secs: 3.0 * 24.0 * 60.0 * 60.0,
            initial_strength: 1.0,
            reinforcement: 0.5,
            eviction_floor: 0.2,
            promotion_strength: 2.5,
            promotion_importance: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LongTermRules {
    /// Importance or confidence at or above this tags an artifact long-term.
    #[validate(range(min = 0.0, max = 1.0))]
    pub tag_threshold: f64,
    #[validate(range(min = 1))]
    pub summary_max_chars: usize,
    #[validate(range(min = 1))]
    pub stale_after_secs: i64,
}

impl Default for LongTermRules {
    fn default() -> Self {
        Self {
            tag_threshold: 0.92,
            summary_max_chars: 2000,
            stale_after_secs: 180 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MemoryRules {
    #[validate(nested)]
    pub short_term: ShortTermRules,
    #[validate(nested)]
    pub mid_term: MidTermRules,
    #[validate(nested)]
    pub long_term: LongTermRules,
}
