//! Min-norm element in the convex hull of task gradients.
//!
//! Solves `min_w || sum_i w_i g_i ||^2` subject to `w` lying on the
//! probability simplex. The best two-task combination seeds the search;
//! projected gradient descent or Frank-Wolfe then refine it when there are
//! three or more tasks.
//!
//! Reference: Sener & Koltun, "Multi-Task Learning as Multi-Objective Optimization"

use core::cmp::Ordering;

use ndarray::{Array1, Array2};
use tracing::{debug, warn};

use crate::error::{FedCkaError, Result};
use crate::tensor::{dot, TaskGradient};

/// Iteration cap for both iterative solvers
pub const MAX_ITER: usize = 250;

/// Convergence threshold on the L1 change of the weights between iterations
pub const STOP_CRIT: f64 = 1e-5;

/// Step candidates at or below this bound are treated as already saturated
const STEP_FLOOR: f64 = 1e-7;

/// Relative bound under which the two-point denominator counts as zero
const DENOM_EPS: f64 = 1e-12;

/// Mixing coefficients used when one endpoint dominates the other
const FAVOR_FIRST: f64 = 0.999;
const FAVOR_SECOND: f64 = 0.001;

/// Iterative refinement used once more than two tasks are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverAlgorithm {
    #[default]
    ProjectedGradient,
    FrankWolfe,
}

/// Simplex weights together with the squared norm they achieve.
#[derive(Debug, Clone, PartialEq)]
pub struct MinNormSolution {
    pub weights: Array1<f64>,
    pub cost: f64,
    /// Refinement iterations run (0 when the two-task seed is returned)
    pub iterations: usize,
}

/// Analytic minimiser of `|c x1 + (1 - c) x2|^2` over `c`.
///
/// Takes `v1v1 = <x1,x1>`, `v1v2 = <x1,x2>`, `v2v2 = <x2,x2>` and returns
/// `(gamma, cost)`.
pub fn min_norm_element_from2(v1v1: f64, v1v2: f64, v2v2: f64) -> (f64, f64) {
    if v1v2 >= v1v1 {
        return (FAVOR_FIRST, v1v1);
    }
    if v1v2 >= v2v2 {
        return (FAVOR_SECOND, v2v2);
    }
    let denom = v1v1 + v2v2 - 2.0 * v1v2;
    // x1 == x2 up to rounding: every mix has the same cost
    if denom <= DENOM_EPS * (v1v1 + v2v2) {
        return (FAVOR_FIRST, v1v1);
    }
    let gamma = -1.0 * ((v1v2 - v2v2) / denom);
    let cost = v2v2 + gamma * (v1v2 - v2v2);
    (gamma, cost)
}

/// Dense symmetric matrix of pairwise gradient inner products.
pub fn gram_matrix(vecs: &[TaskGradient]) -> Result<Array2<f64>> {
    let n = vecs.len();
    let mut gram = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let dp = dot(&vecs[i], &vecs[j])?;
            gram[[i, j]] = dp;
            gram[[j, i]] = dp;
        }
    }
    Ok(gram)
}

/// Best pair `(i, j, gamma, cost)` over all two-task combinations.
fn min_norm_2d(gram: &Array2<f64>) -> (usize, usize, f64, f64) {
    let n = gram.nrows();
    let (gamma, cost) = min_norm_element_from2(gram[[0, 0]], gram[[0, 1]], gram[[1, 1]]);
    let mut best = (0, 1, gamma, cost);
    for i in 0..n {
        for j in (i + 1)..n {
            let (c, d) = min_norm_element_from2(gram[[i, i]], gram[[i, j]], gram[[j, j]]);
            if d < best.3 {
                best = (i, j, c, d);
            }
        }
    }
    best
}

/// Euclidean projection of `y` onto the probability simplex.
pub fn projection_to_simplex(y: &Array1<f64>) -> Array1<f64> {
    let m = y.len();
    let mut sorted = y.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

    let mut tmpsum = 0.0;
    let mut tmax_f = (y.sum() - 1.0) / m as f64;
    for i in 0..m.saturating_sub(1) {
        tmpsum += sorted[i];
        let tmax = (tmpsum - 1.0) / (i as f64 + 1.0);
        if tmax > sorted[i + 1] {
            tmax_f = tmax;
            break;
        }
    }
    y.mapv(|v| (v - tmax_f).max(0.0))
}

fn min_positive_step(values: impl Iterator<Item = f64>) -> Option<f64> {
    values
        .filter(|&t| t > STEP_FLOOR)
        .fold(None, |acc, t| Some(acc.map_or(t, |m: f64| m.min(t))))
}

/// Step along the tangent-projected direction until a coordinate hits a
/// simplex face, then project back onto the simplex.
fn next_point(cur: &Array1<f64>, grad: &Array1<f64>) -> Array1<f64> {
    let n = grad.len() as f64;
    // Components at rounding level carry no direction
    let noise = f64::EPSILON * n * grad.iter().fold(0.0f64, |m, g| m.max(g.abs()));
    let proj_grad = (grad - grad.sum() / n).mapv(|g| if g.abs() <= noise { 0.0 } else { g });

    let to_zero = cur
        .iter()
        .zip(proj_grad.iter())
        .filter(|(_, &g)| g < 0.0)
        .map(|(&c, &g)| -c / g);
    let to_one = cur
        .iter()
        .zip(proj_grad.iter())
        .filter(|(_, &g)| g > 0.0)
        .map(|(&c, &g)| (1.0 - c) / g);

    let mut t = min_positive_step(to_zero).unwrap_or(1.0);
    if let Some(t2) = min_positive_step(to_one) {
        t = t.min(t2);
    }

    projection_to_simplex(&(&proj_grad * t + cur))
}

fn seed(gram: &Array2<f64>) -> (Array1<f64>, f64) {
    let (i, j, gamma, cost) = min_norm_2d(gram);
    let mut weights = Array1::<f64>::zeros(gram.nrows());
    weights[i] = gamma;
    weights[j] = 1.0 - gamma;
    (weights, cost)
}

fn argmin(values: &Array1<f64>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best_i, best_v), (i, &v)| {
            if v < best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

fn l1_change(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

fn iteration_cap(
    gram: &Array2<f64>,
    weights: Array1<f64>,
    algorithm: SolverAlgorithm,
) -> MinNormSolution {
    let cost = weights.dot(&gram.dot(&weights));
    warn!(
        ?algorithm,
        tasks = gram.nrows(),
        cost,
        "Min-norm solver hit MAX_ITER without converging"
    );
    MinNormSolution {
        weights,
        cost,
        iterations: MAX_ITER,
    }
}

/// Solve directly from a precomputed Gram matrix.
pub fn solve_gram(gram: &Array2<f64>, algorithm: SolverAlgorithm) -> Result<MinNormSolution> {
    let n = gram.nrows();
    if n < 2 {
        return Err(FedCkaError::TooFewTasks(n));
    }

    let (mut sol_vec, seed_cost) = seed(gram);
    if n < 3 {
        // The two-task seed is already optimal
        return Ok(MinNormSolution {
            weights: sol_vec,
            cost: seed_cost,
            iterations: 0,
        });
    }

    for iter in 0..MAX_ITER {
        let (new_sol_vec, nd) = match algorithm {
            SolverAlgorithm::ProjectedGradient => {
                let grad_dir = -gram.dot(&sol_vec);
                let new_point = next_point(&sol_vec, &grad_dir);

                let g_cur = gram.dot(&sol_vec);
                let g_new = gram.dot(&new_point);
                let v1v1 = sol_vec.dot(&g_cur);
                let v1v2 = sol_vec.dot(&g_new);
                let v2v2 = new_point.dot(&g_new);

                let (nc, nd) = min_norm_element_from2(v1v1, v1v2, v2v2);
                (&sol_vec * nc + &new_point * (1.0 - nc), nd)
            }
            SolverAlgorithm::FrankWolfe => {
                let g_cur = gram.dot(&sol_vec);
                let t_iter = argmin(&g_cur);

                let v1v1 = sol_vec.dot(&g_cur);
                let v1v2 = sol_vec.dot(&gram.column(t_iter));
                let v2v2 = gram[[t_iter, t_iter]];

                let (nc, nd) = min_norm_element_from2(v1v1, v1v2, v2v2);
                let mut next = &sol_vec * nc;
                next[t_iter] += 1.0 - nc;
                (next, nd)
            }
        };

        if l1_change(&new_sol_vec, &sol_vec) < STOP_CRIT {
            debug!(
                ?algorithm,
                tasks = n,
                iterations = iter + 1,
                cost = nd,
                "Min-norm solver converged"
            );
            return Ok(MinNormSolution {
                weights: sol_vec,
                cost: nd,
                iterations: iter + 1,
            });
        }
        sol_vec = new_sol_vec;
    }

    Ok(iteration_cap(gram, sol_vec, algorithm))
}

/// Min-norm element via projected gradient descent.
pub fn find_min_norm_element(vecs: &[TaskGradient]) -> Result<MinNormSolution> {
    if vecs.len() < 2 {
        return Err(FedCkaError::TooFewTasks(vecs.len()));
    }
    solve_gram(&gram_matrix(vecs)?, SolverAlgorithm::ProjectedGradient)
}

/// Min-norm element via Frank-Wolfe.
pub fn find_min_norm_element_fw(vecs: &[TaskGradient]) -> Result<MinNormSolution> {
    if vecs.len() < 2 {
        return Err(FedCkaError::TooFewTasks(vecs.len()));
    }
    solve_gram(&gram_matrix(vecs)?, SolverAlgorithm::FrankWolfe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn grad(values: &[f32]) -> TaskGradient {
        vec![arr1(values).into_dyn()]
    }

    fn unit(dim: usize, axis: usize) -> TaskGradient {
        let mut v = vec![0.0f32; dim];
        v[axis] = 1.0;
        grad(&v)
    }

    fn random_grads(rng: &mut ChaCha8Rng, n: usize, dim: usize) -> Vec<TaskGradient> {
        (0..n)
            .map(|_| {
                // Split each task into two tensors to exercise concatenation
                let a: Vec<f32> = (0..dim / 2).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let b: Vec<f32> = (dim / 2..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                vec![arr1(&a).into_dyn(), arr1(&b).into_dyn()]
            })
            .collect()
    }

    fn assert_on_simplex(w: &Array1<f64>) {
        assert!((w.sum() - 1.0).abs() < 1e-4, "weights sum to {}", w.sum());
        assert!(w.iter().all(|&x| x >= -1e-6), "negative weight in {w}");
    }

    #[test]
    fn test_from2_cases() {
        // x1 dominated by x2 direction
        assert_eq!(min_norm_element_from2(1.0, 1.0, 4.0), (0.999, 1.0));
        assert_eq!(min_norm_element_from2(4.0, 1.0, 1.0), (0.001, 1.0));

        // orthogonal unit vectors -> midpoint
        let (gamma, cost) = min_norm_element_from2(1.0, 0.0, 1.0);
        assert!((gamma - 0.5).abs() < 1e-12);
        assert!((cost - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_from2_degenerate_denominator_is_finite() {
        // v1v2 a hair below both norms: denominator is rounding noise
        let v12 = 1.0 - f64::EPSILON / 2.0;
        let v22 = 1.0 + 2.0 * f64::EPSILON;
        assert_eq!(min_norm_element_from2(1.0, v12, v22), (0.999, 1.0));
    }

    #[test]
    fn test_two_tasks_match_closed_form() {
        let g1 = grad(&[1.0, 2.0, 0.5]);
        let g2 = grad(&[-1.0, 0.5, 2.0]);
        let v11 = dot(&g1, &g1).unwrap();
        let v12 = dot(&g1, &g2).unwrap();
        let v22 = dot(&g2, &g2).unwrap();
        let (gamma, cost) = min_norm_element_from2(v11, v12, v22);

        let sol = find_min_norm_element(&[g1.clone(), g2.clone()]).unwrap();
        assert_eq!(sol.iterations, 0);
        assert_eq!(sol.weights[0], gamma);
        assert_eq!(sol.weights[1], 1.0 - gamma);
        assert_eq!(sol.cost, cost);

        let fw = find_min_norm_element_fw(&[g1, g2]).unwrap();
        assert_eq!(fw, sol);
    }

    #[test]
    fn test_orthogonal_units_converge_to_uniform() {
        let vecs: Vec<_> = (0..5).map(|i| unit(5, i)).collect();
        let sol = find_min_norm_element(&vecs).unwrap();
        assert_on_simplex(&sol.weights);
        for &w in sol.weights.iter() {
            assert!((w - 0.2).abs() < 1e-6, "weights {}", sol.weights);
        }
        assert!((sol.cost - 0.2).abs() < 1e-6);
        assert!(sol.iterations < MAX_ITER);
    }

    #[test]
    fn test_frank_wolfe_orthogonal_units() {
        let vecs: Vec<_> = (0..5).map(|i| unit(5, i)).collect();
        let sol = find_min_norm_element_fw(&vecs).unwrap();
        assert_on_simplex(&sol.weights);
        for &w in sol.weights.iter() {
            assert!((w - 0.2).abs() < 1e-2, "weights {}", sol.weights);
        }
        assert!((sol.cost - 0.2).abs() < 1e-2, "cost {}", sol.cost);
        if sol.iterations == MAX_ITER {
            // identity Gram: cost of the returned weights is their squared norm
            let own = sol.weights.dot(&sol.weights);
            assert!((sol.cost - own).abs() < 1e-12, "cost {} vs {own}", sol.cost);
        }
    }

    #[test]
    fn test_iteration_cap_reports_cost_of_returned_weights() {
        let gram = Array2::from_diag(&arr1(&[1.0, 2.0, 4.0]));
        let weights = arr1(&[0.5, 0.3, 0.2]);
        let sol = iteration_cap(&gram, weights.clone(), SolverAlgorithm::FrankWolfe);
        assert_eq!(sol.iterations, MAX_ITER);
        assert_eq!(sol.weights, weights);
        // 0.25 + 2 * 0.09 + 4 * 0.04
        assert!((sol.cost - 0.59).abs() < 1e-12, "cost {}", sol.cost);
    }

    #[test]
    fn test_identical_gradients_cost_is_squared_norm() {
        let g = grad(&[3.0, 4.0]);
        let vecs = vec![g.clone(), g.clone(), g];
        for sol in [
            find_min_norm_element(&vecs).unwrap(),
            find_min_norm_element_fw(&vecs).unwrap(),
        ] {
            assert_on_simplex(&sol.weights);
            assert!((sol.cost - 25.0).abs() < 1e-9, "cost {}", sol.cost);
        }
    }

    #[test]
    fn test_random_gradients_stay_on_simplex() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for n in 3..7 {
            let vecs = random_grads(&mut rng, n, 12);
            let gram = gram_matrix(&vecs).unwrap();
            let (_, seed_cost) = seed(&gram);
            for algorithm in [SolverAlgorithm::ProjectedGradient, SolverAlgorithm::FrankWolfe] {
                let sol = solve_gram(&gram, algorithm).unwrap();
                assert_on_simplex(&sol.weights);
                let achieved = sol.weights.dot(&gram.dot(&sol.weights));
                assert!(
                    achieved <= seed_cost * (1.0 + 1e-3) + 1e-6,
                    "{algorithm:?}: {achieved} > {seed_cost}"
                );
            }
        }
    }

    #[test]
    fn test_gram_is_symmetric() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let gram = gram_matrix(&random_grads(&mut rng, 4, 8)).unwrap();
        assert_eq!(gram, gram.t());
    }

    #[test]
    fn test_projection_to_simplex() {
        let p = projection_to_simplex(&arr1(&[0.5, 0.5, 0.5]));
        for &x in p.iter() {
            assert!((x - 1.0 / 3.0).abs() < 1e-12);
        }
        assert_eq!(projection_to_simplex(&arr1(&[2.0, 0.0, 0.0])), arr1(&[1.0, 0.0, 0.0]));
        let inside = arr1(&[0.2, 0.3, 0.5]);
        let p = projection_to_simplex(&inside);
        assert!(l1_change(&p, &inside) < 1e-12);
    }

    #[test]
    fn test_too_few_tasks() {
        assert!(matches!(
            find_min_norm_element(&[grad(&[1.0])]),
            Err(FedCkaError::TooFewTasks(1))
        ));
    }
}
