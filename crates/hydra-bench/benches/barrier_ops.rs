//! Criterion benchmarks for synchronizer round trips.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hydra_engine::Synchronizer;

const ROUNDS: usize = 1_000;

fn round_trips(participants: usize) {
    let sync = Arc::new(Synchronizer::new(participants));
    let workers: Vec<_> = (1..participants)
        .map(|_| {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    sync.barrier();
                }
            })
        })
        .collect();
    for _ in 0..ROUNDS {
        sync.barrier();
    }
    for w in workers {
        w.join().unwrap();
    }
}

fn bench_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier_1000_rounds");
    for participants in [2usize, 3, 5, 9] {
        group.bench_with_input(
            BenchmarkId::from_parameter(participants),
            &participants,
            |b, &p| b.iter(|| round_trips(p)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_barrier);
criterion_main!(benches);
