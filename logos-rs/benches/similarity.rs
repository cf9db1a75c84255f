use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use logos_rs::bundles::EntityMention;
use logos_rs::resolver::{CandidateIndex, CanonicalEntity, EntityResolver};
use logos_rs::utils::{name_similarity, normalize_entity_name};

fn candidate_index(size: usize) -> CandidateIndex {
    (0..size)
        .map(|i| {
            CanonicalEntity::new(format!("org_{i}"), "Organization")
                .with_attribute("name", format!("Company {i} Holdings Pty Ltd"))
        })
        .collect()
}

fn similarity_benchmarks(c: &mut Criterion) {
    c.bench_function("name_similarity/reordered", |b| {
        b.iter(|| name_similarity(black_box("smith john"), black_box("john smith")))
    });

    let suffixes: Vec<String> = ["pty", "ltd", "inc", "llc"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    c.bench_function("normalize_entity_name", |b| {
        b.iter(|| normalize_entity_name(black_box("Acme Widgets Pty. Ltd."), &suffixes))
    });

    let resolver = EntityResolver::default();
    let index = candidate_index(1_000);
    let mention =
        EntityMention::new("m1", "Organization").with_attribute("name", "Company 517 Holdings");
    c.bench_function("resolve/fuzzy_1000", |b| {
        b.iter(|| resolver.resolve(black_box(&mention), &index))
    });
}

criterion_group!(benches, similarity_benchmarks);
criterion_main!(benches);
