//! Benchmarks for the generational slot map backing resource handles
//!
//! Covers bulk insertion, random access through handles and churn (remove + reinsert),
//! the three patterns a resource manager hits when assets are registered and released.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use residency_containers::prelude::SlotMap;
use std::hint::black_box;

fn benchmark_slot_map_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_map_insert");
    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("SlotMap", size), size, |b, &size| {
            b.iter(|| {
                let mut slot_map: SlotMap<u64> = SlotMap::default();
                for i in 0..size {
                    black_box(slot_map.insert(black_box(i)));
                }
                black_box(slot_map)
            });
        });
    }
    group.finish();
}

fn benchmark_slot_map_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_map_get");
    for size in [100, 1000, 10000].iter() {
        let mut slot_map: SlotMap<u64> = SlotMap::default();
        let handles: Vec<_> = (0..*size).map(|i| slot_map.insert(i)).collect();
        group.bench_with_input(BenchmarkId::new("SlotMap", size), size, |b, _| {
            b.iter(|| {
                for handle in handles.iter() {
                    black_box(slot_map.get(*handle));
                }
            });
        });
    }
    group.finish();
}

fn benchmark_slot_map_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_map_churn");
    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("SlotMap", size), size, |b, &size| {
            b.iter(|| {
                let mut slot_map: SlotMap<u64> = SlotMap::default();
                let handles: Vec<_> = (0..size).map(|i| slot_map.insert(i)).collect();
                for handle in handles.into_iter().step_by(2) {
                    black_box(slot_map.remove(handle).ok());
                }
                for i in 0..size / 2 {
                    black_box(slot_map.insert(i));
                }
                black_box(slot_map)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_slot_map_insert,
    benchmark_slot_map_get,
    benchmark_slot_map_churn
);
criterion_main!(benches);
