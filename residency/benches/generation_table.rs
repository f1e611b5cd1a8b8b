//! Benchmarks for generational aging and eviction planning

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use residency::generation::GenerationTable;
use std::hint::black_box;

fn populated(size: u32, seed: u64) -> GenerationTable<u32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut table = GenerationTable::new(8);
    for key in 0..size {
        table.insert(key);
    }
    // spread entries over the buckets
    for _ in 0..8 {
        table.advance_generations(None);
        for _ in 0..size / 4 {
            table.touch(rng.random_range(0..size));
        }
    }
    table
}

fn benchmark_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_advance");
    for size in [1000u32, 10000, 100000].iter() {
        group.bench_with_input(BenchmarkId::new("full", size), size, |b, &size| {
            let mut table = populated(size, 1);
            b.iter(|| black_box(table.advance_generations(None)));
        });
        group.bench_with_input(BenchmarkId::new("batch_256", size), size, |b, &size| {
            let mut table = populated(size, 1);
            b.iter(|| black_box(table.advance_generations(Some(256))));
        });
    }
    group.finish();
}

fn benchmark_touch(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_touch");
    for size in [1000u32, 10000, 100000].iter() {
        let mut table = populated(size.to_owned(), 2);
        let mut rng = StdRng::seed_from_u64(3);
        group.bench_with_input(BenchmarkId::new("random", size), size, |b, &size| {
            b.iter(|| black_box(table.touch(rng.random_range(0..size))));
        });
    }
    group.finish();
}

fn benchmark_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_collect");
    for size in [1000u32, 10000, 100000].iter() {
        let table = populated(*size, 4);
        group.bench_with_input(BenchmarkId::new("tenth", size), size, |b, &size| {
            // every entry is 1 KiB, reclaim a tenth of them
            let overage = size as u64 * 1024 / 10;
            b.iter(|| black_box(table.collect(overage, |key| (key % 7 != 0).then_some(1024))));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_advance, benchmark_touch, benchmark_collect);
criterion_main!(benches);
