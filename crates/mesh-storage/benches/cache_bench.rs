//! Cache hot-path benchmarks: raw writes, compressed writes, reads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mesh_storage::cache::NamespaceConfig;
use mesh_storage::events::NullSink;
use mesh_storage::{Compressor, MemoryTracker, VectorCache};
use std::collections::BTreeMap;
use std::sync::Arc;

fn make_cache(compression: bool) -> VectorCache {
    let sink = Arc::new(NullSink);
    let cache = VectorCache::new(
        Arc::new(Compressor::new(0.9, sink.clone())),
        Arc::new(MemoryTracker::unbounded()),
        sink,
    );
    cache
        .create_namespace(
            "bench",
            NamespaceConfig {
                max_entries: 0,
                max_bytes: 0,
                compression_enabled: compression,
                compression_dim_threshold: 256,
                ..Default::default()
            },
        )
        .unwrap();
    cache
}

fn vector(dim: usize, seed: usize) -> Vec<f32> {
    (0..dim)
        .map(|j| ((seed * 31 + j * 7) % 101) as f32 / 101.0 - 0.5)
        .collect()
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_set");
    for dim in [128usize, 768] {
        group.bench_with_input(BenchmarkId::new("raw", dim), &dim, |b, &dim| {
            let cache = make_cache(false);
            let mut i = 0usize;
            b.iter(|| {
                cache
                    .set("bench", &format!("k{i}"), vector(dim, i), BTreeMap::new())
                    .unwrap();
                i += 1;
            });
        });
        group.bench_with_input(BenchmarkId::new("compressed", dim), &dim, |b, &dim| {
            let cache = make_cache(true);
            let mut i = 0usize;
            b.iter(|| {
                cache
                    .set("bench", &format!("k{i}"), vector(dim, i), BTreeMap::new())
                    .unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_get_vector(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_vector");
    for (label, compression) in [("raw", false), ("compressed", true)] {
        group.bench_function(BenchmarkId::new(label, 768), |b| {
            let cache = make_cache(compression);
            for i in 0..1024 {
                cache
                    .set("bench", &format!("k{i}"), vector(768, i), BTreeMap::new())
                    .unwrap();
            }
            let mut i = 0usize;
            b.iter(|| {
                let key = format!("k{}", i % 1024);
                black_box(cache.get_vector("bench", &key).unwrap());
                i += 1;
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_set, bench_get_vector);
criterion_main!(benches);
