//! Criterion benchmarks for hashing, device-map derivation and the
//! bucket partition.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hydra_bench::{reference_profile, stress_profile, PartitionProfile};
use hydra_partition::{partition, DeviceMap};

fn split_map(p: &PartitionProfile) -> DeviceMap {
    let axis = p.grid.longest_axis();
    let histogram = p
        .grid
        .slice_histogram(&p.particles, axis, |_| true)
        .unwrap();
    DeviceMap::split_along(&p.grid, axis, &histogram, &p.topology).unwrap()
}

fn bench_hash_100k(c: &mut Criterion) {
    let p = reference_profile(42).unwrap();
    let mut particles = p.particles.clone();
    c.bench_function("hash_100k", |b| {
        b.iter(|| {
            p.grid.hash_particles(&mut particles).unwrap();
            black_box(&particles);
        });
    });
}

fn bench_split_map_100k(c: &mut Criterion) {
    let p = reference_profile(42).unwrap();
    c.bench_function("split_map_100k", |b| {
        b.iter(|| black_box(split_map(&p)));
    });
}

fn bench_partition_100k(c: &mut Criterion) {
    let p = reference_profile(42).unwrap();
    let map = split_map(&p);
    c.bench_function("partition_100k_4dev", |b| {
        b.iter_batched(
            || p.particles.clone(),
            |mut particles| black_box(partition(&mut particles, &map, &p.topology).unwrap()),
            BatchSize::LargeInput,
        );
    });
}

fn bench_partition_1m(c: &mut Criterion) {
    let p = stress_profile(42).unwrap();
    let map = split_map(&p);
    let mut group = c.benchmark_group("stress");
    group.sample_size(10);
    group.bench_function("partition_1m_8dev", |b| {
        b.iter_batched(
            || p.particles.clone(),
            |mut particles| black_box(partition(&mut particles, &map, &p.topology).unwrap()),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_hash_100k,
    bench_split_map_100k,
    bench_partition_100k,
    bench_partition_1m
);
criterion_main!(benches);
