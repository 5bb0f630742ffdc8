//! Linear centered kernel alignment between activation matrices.

use std::collections::BTreeMap;

use ndarray::{Array2, Axis};

use crate::error::{FedCkaError, Result};
use crate::representation::Activations;

/// Guards every division in the estimator
pub const CKA_EPS: f64 = 1e-12;

/// Centered linear Gram matrix of one activation matrix, with its
/// self-HSIC cached for repeated pairings.
#[derive(Debug, Clone)]
pub struct CenteredGram {
    gram: Array2<f64>,
    self_hsic: f64,
}

impl CenteredGram {
    pub fn new(activations: &Array2<f32>) -> Result<Self> {
        if activations.nrows() == 0 {
            return Err(FedCkaError::EmptyReference);
        }
        let x = activations.mapv(f64::from);
        let means = x
            .mean_axis(Axis(0))
            .ok_or(FedCkaError::EmptyReference)?;
        let centered = x - &means;
        let gram = centered.dot(&centered.t());
        let self_hsic = hsic(&gram, &gram);
        Ok(Self { gram, self_hsic })
    }

    pub fn rows(&self) -> usize {
        self.gram.nrows()
    }

    /// CKA against another centered Gram matrix of the same row count.
    pub fn similarity(&self, other: &CenteredGram) -> Result<f64> {
        if self.rows() != other.rows() {
            return Err(FedCkaError::RowMismatch(self.rows(), other.rows()));
        }
        let cross = hsic(&self.gram, &other.gram);
        Ok(cross / (self.self_hsic * other.self_hsic + CKA_EPS).sqrt())
    }
}

/// `trace(K L) / ((n - 1)^2 + eps)` for symmetric `K` and `L`.
fn hsic(k: &Array2<f64>, l: &Array2<f64>) -> f64 {
    let n = k.nrows() as f64;
    // trace(KL) equals the sum of the elementwise product when L is symmetric
    let trace: f64 = k.iter().zip(l.iter()).map(|(a, b)| a * b).sum();
    trace / ((n - 1.0).powi(2) + CKA_EPS)
}

/// Linear CKA of two activation matrices over the same reference rows.
///
/// Symmetric in its arguments and close to 1.0 for a matrix against itself.
/// Zero-variance inputs give 0.0 rather than NaN.
pub fn linear_cka(x: &Array2<f32>, y: &Array2<f32>) -> Result<f64> {
    if x.nrows() != y.nrows() {
        return Err(FedCkaError::RowMismatch(x.nrows(), y.nrows()));
    }
    CenteredGram::new(x)?.similarity(&CenteredGram::new(y)?)
}

/// Full symmetric `m x m` similarity matrix, diagonal included.
pub fn similarity_matrix(activations: &[&Array2<f32>]) -> Result<Array2<f64>> {
    let grams = activations
        .iter()
        .map(|a| CenteredGram::new(a))
        .collect::<Result<Vec<_>>>()?;

    let m = grams.len();
    let mut sim = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        for j in i..m {
            let s = grams[i].similarity(&grams[j])?;
            sim[[i, j]] = s;
            sim[[j, i]] = s;
        }
    }
    Ok(sim)
}

/// One similarity matrix per layer across every client's activations.
pub fn layerwise_similarity<S: AsRef<str>>(
    per_client: &[Activations],
    layers: &[S],
) -> Result<BTreeMap<String, Array2<f64>>> {
    layers
        .iter()
        .map(|layer| {
            let layer = layer.as_ref();
            let mats = per_client
                .iter()
                .map(|acts| {
                    acts.get(layer)
                        .ok_or_else(|| FedCkaError::UnknownLayer(layer.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((layer.to_string(), similarity_matrix(&mats)?))
        })
        .collect()
}

/// Colour range `(mean - 3 sd, mean + 3 sd)` over every entry of a
/// similarity matrix, for heat maps.
pub fn heatmap_range(sim: &Array2<f64>) -> (f64, f64) {
    if sim.is_empty() {
        return (0.0, 1.0);
    }
    let mean = sim.mean().unwrap_or(0.0);
    let sd = sim.std(0.0);
    (mean - 3.0 * sd, mean + 3.0 * sd)
}
