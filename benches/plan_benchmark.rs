//! Performance benchmarks for diff planning
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use s3mirror::mirror::{plan, ObjectRecord};

/// Listing of `count` keys spread over nested prefixes
fn listing(count: usize, offset: usize) -> Vec<ObjectRecord> {
    (offset..offset + count)
        .map(|i| ObjectRecord::new(format!("sample_{:03}/reads/chunk_{:07}.bam", i % 500, i), (i as u64 % 4096) * 1024))
        .collect()
}

fn bench_plan_full_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_full_listing");

    for count in [1_000usize, 10_000, 100_000].iter() {
        let source = listing(*count, 0);
        // Destination already holds half the keys
        let destination = listing(*count / 2, 0);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(plan(&source, &destination, None)))
        });
    }

    group.finish();
}

fn bench_plan_explicit_keys(c: &mut Criterion) {
    let source = listing(100_000, 0);
    let destination = listing(10_000, 0);
    let keys: Vec<String> = source.iter().step_by(10).map(|r| r.key.clone()).collect();

    c.bench_function("plan_10k_explicit_keys", |b| {
        b.iter(|| black_box(plan(&source, &destination, Some(&keys))))
    });
}

fn bench_plan_empty_destination(c: &mut Criterion) {
    let source = listing(100_000, 0);

    c.bench_function("plan_100k_empty_destination", |b| {
        b.iter(|| black_box(plan(&source, &[], None)))
    });
}

criterion_group!(
    benches,
    bench_plan_full_listing,
    bench_plan_explicit_keys,
    bench_plan_empty_destination,
);
criterion_main!(benches);
