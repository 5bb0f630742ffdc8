//! Min-norm solver benchmarks
//!
//! Compares projected gradient and Frank-Wolfe over growing task counts and
//! gradient sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fedcka_core::mgda::solver::{
    find_min_norm_element, find_min_norm_element_fw, gram_matrix, solve_gram, SolverAlgorithm,
};
use fedcka_core::TaskGradient;
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// One gradient set per task, each split over a weight and a bias tensor
fn generate_task_gradients(n_tasks: usize, dim: usize, seed: u64) -> Vec<TaskGradient> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n_tasks)
        .map(|_| {
            let weight = ArrayD::from_shape_fn(IxDyn(&[dim, 8]), |_| rng.gen_range(-1.0f32..1.0));
            let bias = ArrayD::from_shape_fn(IxDyn(&[8]), |_| rng.gen_range(-1.0f32..1.0));
            vec![weight, bias]
        })
        .collect()
}

fn bench_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("min_norm_solver");
    group.measurement_time(Duration::from_secs(5));

    for n_tasks in [2, 3, 5, 8].iter() {
        let grads = generate_task_gradients(*n_tasks, 256, 42);

        group.bench_with_input(
            BenchmarkId::new("ProjectedGradient", n_tasks),
            &grads,
            |b, grads| {
                b.iter(|| find_min_norm_element(black_box(grads)));
            },
        );

        group.bench_with_input(BenchmarkId::new("FrankWolfe", n_tasks), &grads, |b, grads| {
            b.iter(|| find_min_norm_element_fw(black_box(grads)));
        });
    }

    group.finish();
}

/// Separates the Gram matrix cost from the iteration cost
fn bench_gram_vs_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("gram_vs_solve");

    for dim in [64, 1024, 8192].iter() {
        let grads = generate_task_gradients(5, *dim, 7);
        group.bench_with_input(BenchmarkId::new("gram", dim), &grads, |b, grads| {
            b.iter(|| gram_matrix(black_box(grads)));
        });

        if let Ok(gram) = gram_matrix(&grads) {
            group.bench_with_input(BenchmarkId::new("solve", dim), &gram, |b, gram| {
                b.iter(|| solve_gram(black_box(gram), SolverAlgorithm::ProjectedGradient));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_solvers, bench_gram_vs_solve);
criterion_main!(benches);
