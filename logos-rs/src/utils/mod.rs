//! Shared utilities.
//!
//! Includes:
//! - Date/time helpers (flexible parsing of hand-edited YAML timestamps)
//! - Surface-string normalisation for entity names and stable keys
//! - Name similarity scoring for fuzzy resolution

pub mod datetime;
pub mod similarity;
pub mod text;

pub use datetime::parse_flexible_datetime;
pub use similarity::{name_similarity, token_sort};
pub use text::{
    extract_json_from_response, normalize_entity_name, normalize_key, normalize_whitespace,
    truncate_with_ellipsis,
};
