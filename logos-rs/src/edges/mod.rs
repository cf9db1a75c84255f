//! Edge model of the knowledge graph.

pub mod entity;

pub use entity::GraphEdge;
