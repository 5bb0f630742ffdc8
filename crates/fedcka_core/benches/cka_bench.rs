//! CKA scoring benchmarks
//!
//! Pairwise linear CKA and the full per-round similarity matrix.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fedcka_core::cka::{linear_cka, similarity_matrix};
use fedcka_core::defence::select_survivors;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// Activations of `n_clients` models on `ref_size` reference rows
fn generate_activations(n_clients: usize, ref_size: usize, features: usize) -> Vec<Array2<f32>> {
    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    (0..n_clients)
        .map(|_| Array2::from_shape_fn((ref_size, features), |_| rng.gen_range(0.0f32..1.0)))
        .collect()
}

fn bench_pairwise(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_cka");
    group.measurement_time(Duration::from_secs(5));

    for ref_size in [16, 32, 128].iter() {
        let acts = generate_activations(2, *ref_size, 512);
        group.bench_with_input(BenchmarkId::new("pair", ref_size), &acts, |b, acts| {
            b.iter(|| linear_cka(black_box(&acts[0]), black_box(&acts[1])));
        });
    }

    group.finish();
}

fn bench_round(c: &mut Criterion) {
    let mut group = c.benchmark_group("cka_round");

    for n_clients in [10, 20, 50].iter() {
        let acts = generate_activations(*n_clients, 32, 256);
        let refs: Vec<&Array2<f32>> = acts.iter().collect();

        group.bench_with_input(BenchmarkId::new("matrix", n_clients), &refs, |b, refs| {
            b.iter(|| similarity_matrix(black_box(refs)));
        });

        if let Ok(sim) = similarity_matrix(&refs) {
            group.bench_with_input(BenchmarkId::new("select", n_clients), &sim, |b, sim| {
                b.iter(|| select_survivors(black_box(sim), 0.5));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_pairwise, bench_round);
criterion_main!(benches);
