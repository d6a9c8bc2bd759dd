//! Benchmarks for the update dispatcher.
//!
//! Run with: cargo bench
//! View results in: target/criterion/report/index.html

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use coalescer::contracts::{FieldUpdate, MergePolicy, TargetRef};
use coalescer::dispatcher::{Dispatcher, DispatcherConfig, LastWriteWins, SumIncrements};
use coalescer::storage::MemoryStore;

fn create_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Dispatch Benchmarks
// =============================================================================

fn bench_dispatch_burst(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("dispatch_burst");

    // Same burst size spread over a growing number of targets
    for targets in [1usize, 16, 256].iter() {
        let burst = 1_000;
        let keys: Vec<TargetRef> = (0..*targets)
            .map(|i| TargetRef::doc("events", &format!("e{}", i)))
            .collect();

        group.throughput(Throughput::Elements(burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(targets), targets, |b, _| {
            b.iter(|| {
                let store = Arc::new(MemoryStore::new());
                let dispatcher = rt
                    .block_on(async { Dispatcher::new(store, DispatcherConfig::default()) })
                    .unwrap();
                for i in 0..burst {
                    dispatcher.dispatch(&keys[i % keys.len()], "Going", black_box(json!(i)));
                }
                rt.block_on(dispatcher.wait_idle());
            });
        });
    }

    group.finish();
}

fn bench_gate_capacity(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("gate_capacity");
    let keys: Vec<TargetRef> = (0..64)
        .map(|i| TargetRef::doc("events", &format!("e{}", i)))
        .collect();

    for capacity in [1usize, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            capacity,
            |b, &capacity| {
                b.iter(|| {
                    let store = Arc::new(MemoryStore::new());
                    let dispatcher = rt
                        .block_on(async {
                            Dispatcher::new(
                                store,
                                DispatcherConfig::with_max_concurrent_flushes(capacity),
                            )
                        })
                        .unwrap();
                    for (i, key) in keys.iter().enumerate() {
                        dispatcher.dispatch_update(key, FieldUpdate::increment("Going", i as i64));
                    }
                    rt.block_on(dispatcher.wait_idle());
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// Merge Benchmarks
// =============================================================================

fn bench_merge_policies(c: &mut Criterion) {
    let updates: Vec<FieldUpdate> = (0..256)
        .map(|i| {
            if i % 3 == 0 {
                FieldUpdate::set(format!("f{}", i % 8), i)
            } else {
                FieldUpdate::increment(format!("f{}", i % 8), 1)
            }
        })
        .collect();

    c.bench_function("merge_last_write_wins_256", |b| {
        b.iter(|| LastWriteWins.combine(black_box(updates.clone())))
    });
    c.bench_function("merge_sum_increments_256", |b| {
        b.iter(|| SumIncrements.combine(black_box(updates.clone())))
    });
}

criterion_group!(
    benches,
    bench_dispatch_burst,
    bench_gate_capacity,
    bench_merge_policies,
);
criterion_main!(benches);
