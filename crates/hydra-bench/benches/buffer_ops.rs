//! Criterion micro-benchmarks for double-buffer role swaps and
//! whole-particle element swaps.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use hydra_arena::{BufferList, Multiplicity};
use hydra_core::{BufferKey, BufferSet};

const N: usize = 100_000;

fn device_list() -> BufferList {
    let mut list = BufferList::new(N);
    list.register_all(BufferSet::POST_COMPUTE_SWAP.keys_only(), Multiplicity::Double);
    list.register_all(
        BufferKey::Info | BufferKey::Hash | BufferKey::NeibsList,
        Multiplicity::Single,
    );
    list
}

fn bench_swap_roles(c: &mut Criterion) {
    let mut list = device_list();
    let set = BufferSet::POST_COMPUTE_SWAP;
    c.bench_function("swap_roles_post_compute", |b| {
        b.iter(|| {
            list.swap_roles(black_box(set)).unwrap();
        });
    });
}

fn bench_swap_elements(c: &mut Criterion) {
    let mut list = device_list();
    let mut i = 0usize;
    c.bench_function("swap_elements_100k", |b| {
        b.iter(|| {
            i = (i + 7919) % N;
            list.swap_elements(black_box(i), black_box(N - 1 - i));
        });
    });
}

criterion_group!(benches, bench_swap_roles, bench_swap_elements);
criterion_main!(benches);
