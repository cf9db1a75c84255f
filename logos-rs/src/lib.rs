//! # logos-rs
//!
//! Core of the Logos interaction-to-knowledge-graph system: typed bundle
//! pipelines, entity resolution, a runtime-extensible schema registry,
//! multi-tier memory, and idempotent graph upserts.
//!
//! ## Architecture
//!
//! - **Schema registry**: versioned node/relationship type definitions with usage-based deprecation
//! - **Entity resolver**: exact key → fuzzy name → contextual disambiguation, three-state decisions
//! - **Memory tiers**: short/mid/long-term markers with decay, reinforcement and promotion
//! - **Upsert engine**: merge-by-identity graph writes with provenance and batch reporting
//! - **Pipeline executor**: ordered stages over typed bundles with retry, deadlines and run logs

pub mod bundles;
pub mod edges;
pub mod errors;
pub mod nodes;
pub mod types;

pub mod driver;
pub mod extract;
pub mod memory;
pub mod resolver;
pub mod schema;
pub mod upsert;

pub mod pipeline;
pub mod utils;

pub use errors::{LogosError, Result};
pub use types::LogosConfig;
