//! The knowledgebase documents shipped with the repository load and agree
//! with the built-in stages.

use logos_rs::memory::MemoryRules;
use logos_rs::pipeline::stages::builtin_registry;
use logos_rs::pipeline::{PipelineCatalog, Workflow};
use logos_rs::resolver::ResolverConfig;
use logos_rs::schema::{DeprecationPolicy, SchemaRegistry, SchemaStore, TypeKind, YamlSchemaStore};
use logos_rs::LogosConfig;

fn shipped() -> LogosConfig {
    LogosConfig {
        kb_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/../knowledgebase").to_string(),
        ..LogosConfig::default()
    }
}

#[test]
fn shipped_pipelines_match_the_builtin_catalog() {
    let config = shipped();
    let catalog = PipelineCatalog::load(&config.pipelines_path()).unwrap();
    assert_eq!(catalog, PipelineCatalog::builtin());

    let warnings = catalog.validate(&builtin_registry()).unwrap();
    assert!(warnings.is_empty(), "{warnings:?}");
    for workflow in Workflow::ALL {
        assert!(catalog.for_workflow(workflow).is_some(), "{workflow} is unbound");
    }
}

#[test]
fn shipped_rules_are_the_defaults() {
    let config = shipped();
    assert_eq!(config.load_resolver_config().unwrap(), ResolverConfig::default());
    assert_eq!(config.load_memory_rules().unwrap(), MemoryRules::default());
}

#[test]
fn shipped_schema_seeds_core_types() {
    let config = shipped();
    // Loading only reads; the shipped file is never written here.
    let registry = SchemaRegistry::load(
        YamlSchemaStore::new(config.schema_path()),
        DeprecationPolicy::Warn,
    )
    .unwrap();

    for key in ["Person", "Organization", "Interaction"] {
        assert_eq!(registry.resolve(key).unwrap().kind, TypeKind::Node);
    }
    for key in ["MENTIONS", "WORKS_FOR"] {
        assert_eq!(registry.resolve(key).unwrap().kind, TypeKind::Relationship);
    }
}

#[test]
fn hand_edits_cannot_delete_shipped_types() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema.yml");
    std::fs::copy(shipped().schema_path(), &path).unwrap();
    let store = YamlSchemaStore::new(path);
    let registry = SchemaRegistry::load(store.clone(), DeprecationPolicy::Warn).unwrap();
    let version = registry.version();

    let mut edited = store.load().unwrap();
    edited.node_types.remove("Organization");
    edited.relationship_types.remove("MENTIONS");
    store.save(&edited).unwrap();
    registry.reload().unwrap();

    assert_eq!(registry.resolve("Organization").unwrap().kind, TypeKind::Node);
    assert_eq!(registry.resolve("MENTIONS").unwrap().kind, TypeKind::Relationship);
    assert!(registry.version() >= version);
    let on_disk = store.load().unwrap();
    assert!(on_disk.node_types.contains_key("Organization"));
    assert!(on_disk.relationship_types.contains_key("MENTIONS"));
}
