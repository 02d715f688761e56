//! Performance benchmarks for memory operations.

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use engram::embedding::{Embedder, LocalEmbedder};
use engram::storage::{SqliteBackend, StorageBackend};
use engram::types::{ListFilters, Memory};

fn make_backend() -> SqliteBackend {
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(64));
    SqliteBackend::in_memory(embedder).unwrap()
}

fn seed(backend: &SqliteBackend, count: usize) -> Vec<String> {
    let mut hashes = Vec::with_capacity(count);
    for i in 0..count {
        let memory = Memory::new(
            format!("Memory content number {i} with some longer text to simulate real usage"),
            vec![format!("tag{}", i % 10), format!("category{}", i % 5)],
            None,
            HashMap::new(),
        )
        .unwrap();
        hashes.push(memory.content_hash.clone());
        backend.store(memory).unwrap();
    }
    hashes
}

fn bench_store(c: &mut Criterion) {
    let backend = make_backend();

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("no_embedding_cache_hit", |b| {
        b.iter(|| {
            let memory = Memory::new(
                "Test content for benchmarking purposes".to_string(),
                vec!["benchmark".to_string()],
                None,
                HashMap::new(),
            )
            .unwrap();
            backend.store(black_box(memory)).unwrap()
        })
    });

    group.finish();
}

fn bench_retrieve(c: &mut Criterion) {
    let backend = make_backend();
    seed(&backend, 1000);

    let mut group = c.benchmark_group("retrieve");
    group.throughput(Throughput::Elements(1));

    group.bench_function("top_10", |b| {
        b.iter(|| backend.retrieve(black_box("memory content number"), 10, 0.0).unwrap())
    });

    group.finish();
}

fn bench_search_by_tag(c: &mut Criterion) {
    let backend = make_backend();
    seed(&backend, 1000);

    let mut group = c.benchmark_group("search_by_tag");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_tag_or", |b| {
        b.iter(|| backend.search_by_tag(black_box(&["tag5".to_string()]), false).unwrap())
    });

    group.bench_function("two_tags_and", |b| {
        let tags = vec!["tag5".to_string(), "category2".to_string()];
        b.iter(|| backend.search_by_tag(black_box(&tags), true).unwrap())
    });

    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let backend = make_backend();
    seed(&backend, 1000);

    let mut group = c.benchmark_group("list");

    for limit in [10, 50, 100].iter() {
        group.throughput(Throughput::Elements(*limit as u64));

        group.bench_with_input(BenchmarkId::new("unfiltered", limit), limit, |b, &limit| {
            b.iter(|| backend.list(0, black_box(limit), ListFilters::default()).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("with_tag_filter", limit), limit, |b, &limit| {
            let filters = ListFilters {
                tag: Some("tag5".to_string()),
                memory_type: None,
            };
            b.iter(|| backend.list(0, black_box(limit), filters.clone()).unwrap())
        });
    }

    group.finish();
}

fn bench_stats(c: &mut Criterion) {
    let backend = make_backend();
    seed(&backend, 500);

    c.bench_function("get_stats", |b| b.iter(|| backend.get_stats().unwrap()));
}

criterion_group!(
    benches,
    bench_store,
    bench_retrieve,
    bench_search_by_tag,
    bench_list,
    bench_stats,
);

criterion_main!(benches);
