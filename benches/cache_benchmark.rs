use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::thread;

use cachette::{EvictionPolicyKind, LocalCache};

fn new_cache(name: &str, policy: EvictionPolicyKind<u64, String>, high: i64) -> LocalCache<u64, String> {
    LocalCache::builder(name.to_string())
        .high_units(high)
        .eviction_policy(policy)
        .build()
        .expect("valid config")
}

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in [100u64, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("hybrid", size), size, |b, &size| {
            let cache = new_cache("bench-insert-hybrid", EvictionPolicyKind::Hybrid, size as i64);
            let mut key = 0u64;
            b.iter(|| {
                key = key.wrapping_add(1);
                cache.insert(black_box(key % size), format!("v{key}")).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("lru", size), size, |b, &size| {
            let cache = new_cache("bench-insert-lru", EvictionPolicyKind::Lru, size as i64);
            let mut key = 0u64;
            b.iter(|| {
                key = key.wrapping_add(1);
                cache.insert(black_box(key % size), format!("v{key}")).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit");

    let cache = new_cache("bench-get", EvictionPolicyKind::Hybrid, i64::MAX);
    for key in 0..10_000u64 {
        cache.insert(key, format!("v{key}")).unwrap();
    }

    group.bench_function("hybrid", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = key.wrapping_add(7);
            black_box(cache.get(&(key % 10_000)));
        });
    });
    group.finish();
}

fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_reads");
    group.sample_size(20);

    let cache = Arc::new(new_cache("bench-concurrent", EvictionPolicyKind::Hybrid, i64::MAX));
    for key in 0..1_000u64 {
        cache.insert(key, format!("v{key}")).unwrap();
    }

    group.bench_function("eight_readers", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let cache = Arc::clone(&cache);
                    thread::spawn(move || {
                        for i in 0..1_000u64 {
                            black_box(cache.get(&((i + t) % 1_000)));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_get_hit,
    bench_concurrent_reads
);
criterion_main!(benches);
