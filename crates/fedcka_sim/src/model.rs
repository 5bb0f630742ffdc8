//! Two-layer perceptron used as the federated model.
//!
//! `fc1 -> relu -> fc2`, softmax cross-entropy, gradients by hand. Capture
//! points are named after the layers.

use fedcka_core::{
    ActivationCapture, ClientUpdate, FedCkaError, Model, TaskGradient, Tensor,
};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::Rng;

/// Parameter names, in the order gradients are returned
pub const PARAM_NAMES: [&str; 4] = ["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"];

/// Capturable layers, in forward order
pub const LAYER_NAMES: [&str; 3] = ["fc1", "relu", "fc2"];

#[derive(Debug, Clone)]
pub struct Mlp {
    fc1_weight: Array2<f32>,
    fc1_bias: Array1<f32>,
    fc2_weight: Array2<f32>,
    fc2_bias: Array1<f32>,
    training: bool,
    grads_enabled: bool,
}

/// Intermediate values of a training forward pass.
struct ForwardCache {
    z1: Array2<f32>,
    h: Array2<f32>,
    logits: Array2<f32>,
}

impl Mlp {
    /// Uniform init in `±1/sqrt(fan_in)` per layer.
    pub fn new<R: Rng + ?Sized>(inputs: usize, hidden: usize, classes: usize, rng: &mut R) -> Self {
        let b1 = 1.0 / (inputs as f32).sqrt();
        let b2 = 1.0 / (hidden as f32).sqrt();
        Self {
            fc1_weight: Array2::from_shape_fn((inputs, hidden), |_| rng.gen_range(-b1..b1)),
            fc1_bias: Array1::from_shape_fn(hidden, |_| rng.gen_range(-b1..b1)),
            fc2_weight: Array2::from_shape_fn((hidden, classes), |_| rng.gen_range(-b2..b2)),
            fc2_bias: Array1::from_shape_fn(classes, |_| rng.gen_range(-b2..b2)),
            training: true,
            grads_enabled: true,
        }
    }

    pub fn classes(&self) -> usize {
        self.fc2_bias.len()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn forward_cached(&self, x: &Array2<f32>) -> fedcka_core::Result<ForwardCache> {
        if x.ncols() != self.fc1_weight.nrows() {
            return Err(FedCkaError::ShapeMismatch {
                name: "inputs".to_string(),
                expected: vec![x.nrows(), self.fc1_weight.nrows()],
                actual: x.shape().to_vec(),
            });
        }
        let z1 = x.dot(&self.fc1_weight) + &self.fc1_bias;
        let h = z1.mapv(|v| v.max(0.0));
        let logits = h.dot(&self.fc2_weight) + &self.fc2_bias;
        Ok(ForwardCache { z1, h, logits })
    }

    pub fn logits(&self, x: &Array2<f32>) -> fedcka_core::Result<Array2<f32>> {
        Ok(self.forward_cached(x)?.logits)
    }

    /// Most likely class per row.
    pub fn predict(&self, x: &Array2<f32>) -> fedcka_core::Result<Vec<usize>> {
        let logits = self.logits(x)?;
        Ok(logits
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect())
    }

    /// Mean cross-entropy over the batch, with its gradient on request.
    pub fn loss_and_grad(
        &self,
        x: &Array2<f32>,
        labels: &[usize],
        compute_grad: bool,
    ) -> fedcka_core::Result<(f64, Option<TaskGradient>)> {
        if x.nrows() != labels.len() {
            return Err(FedCkaError::RowMismatch(x.nrows(), labels.len()));
        }
        let cache = self.forward_cached(x)?;
        let n = labels.len().max(1) as f32;
        let classes = self.classes();

        let mut probs = cache.logits.clone();
        let mut loss = 0.0f64;
        for (mut row, &label) in probs.outer_iter_mut().zip(labels) {
            if label >= classes {
                return Err(FedCkaError::ShapeMismatch {
                    name: "labels".to_string(),
                    expected: vec![classes],
                    actual: vec![label + 1],
                });
            }
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
            loss -= f64::from(row[label].max(f32::MIN_POSITIVE)).ln();
        }
        let loss = loss / f64::from(n);

        if !compute_grad {
            return Ok((loss, None));
        }

        // d loss / d logits = (softmax - onehot) / n
        let mut dlogits = probs;
        for (mut row, &label) in dlogits.outer_iter_mut().zip(labels) {
            row[label] -= 1.0;
        }
        dlogits.mapv_inplace(|v| v / n);

        let d_fc2_weight = cache.h.t().dot(&dlogits);
        let d_fc2_bias = dlogits.sum_axis(Axis(0));
        let mut dz1 = dlogits.dot(&self.fc2_weight.t());
        dz1.zip_mut_with(&cache.z1, |g, &z| {
            if z <= 0.0 {
                *g = 0.0;
            }
        });
        let d_fc1_weight = x.t().dot(&dz1);
        let d_fc1_bias = dz1.sum_axis(Axis(0));

        Ok((
            loss,
            Some(vec![
                d_fc1_weight.into_dyn(),
                d_fc1_bias.into_dyn(),
                d_fc2_weight.into_dyn(),
                d_fc2_bias.into_dyn(),
            ]),
        ))
    }

    /// Plain SGD step. A no-op while gradients are switched off.
    pub fn apply_gradient(&mut self, grad: &[Tensor], lr: f32) -> fedcka_core::Result<()> {
        if !self.grads_enabled {
            return Ok(());
        }
        if grad.len() != PARAM_NAMES.len() {
            return Err(FedCkaError::GradientLengthMismatch {
                expected: PARAM_NAMES.len(),
                actual: grad.len(),
            });
        }
        let g1w = as_dim::<Ix2>(PARAM_NAMES[0], &grad[0], self.fc1_weight.shape())?;
        let g1b = as_dim::<Ix1>(PARAM_NAMES[1], &grad[1], self.fc1_bias.shape())?;
        let g2w = as_dim::<Ix2>(PARAM_NAMES[2], &grad[2], self.fc2_weight.shape())?;
        let g2b = as_dim::<Ix1>(PARAM_NAMES[3], &grad[3], self.fc2_bias.shape())?;
        self.fc1_weight.scaled_add(-lr, &g1w);
        self.fc1_bias.scaled_add(-lr, &g1b);
        self.fc2_weight.scaled_add(-lr, &g2w);
        self.fc2_bias.scaled_add(-lr, &g2b);
        Ok(())
    }
}

fn as_dim<D: ndarray::Dimension>(
    name: &str,
    tensor: &Tensor,
    expected: &[usize],
) -> fedcka_core::Result<ndarray::Array<f32, D>> {
    if tensor.shape() != expected {
        return Err(FedCkaError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: tensor.shape().to_vec(),
        });
    }
    tensor
        .clone()
        .into_dimensionality::<D>()
        .map_err(|_| FedCkaError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: tensor.shape().to_vec(),
        })
}

impl Model for Mlp {
    fn state(&self) -> ClientUpdate {
        let mut state = ClientUpdate::new();
        state.insert(PARAM_NAMES[0], self.fc1_weight.clone().into_dyn());
        state.insert(PARAM_NAMES[1], self.fc1_bias.clone().into_dyn());
        state.insert(PARAM_NAMES[2], self.fc2_weight.clone().into_dyn());
        state.insert(PARAM_NAMES[3], self.fc2_bias.clone().into_dyn());
        state
    }

    fn load_state(&mut self, state: &ClientUpdate) -> fedcka_core::Result<()> {
        if let Some(extra) = state.names().find(|n| !PARAM_NAMES.contains(n)) {
            return Err(FedCkaError::UnexpectedParameter(extra.to_string()));
        }
        let get = |name: &str| {
            state
                .get(name)
                .ok_or_else(|| FedCkaError::MissingParameter(name.to_string()))
        };
        // validate everything before touching any parameter
        let fc1_weight = as_dim::<Ix2>(PARAM_NAMES[0], get(PARAM_NAMES[0])?, self.fc1_weight.shape())?;
        let fc1_bias = as_dim::<Ix1>(PARAM_NAMES[1], get(PARAM_NAMES[1])?, self.fc1_bias.shape())?;
        let fc2_weight = as_dim::<Ix2>(PARAM_NAMES[2], get(PARAM_NAMES[2])?, self.fc2_weight.shape())?;
        let fc2_bias = as_dim::<Ix1>(PARAM_NAMES[3], get(PARAM_NAMES[3])?, self.fc2_bias.shape())?;

        self.fc1_weight = fc1_weight;
        self.fc1_bias = fc1_bias;
        self.fc2_weight = fc2_weight;
        self.fc2_bias = fc2_bias;
        Ok(())
    }

    fn layer_names(&self) -> Vec<String> {
        LAYER_NAMES.iter().map(|l| l.to_string()).collect()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn switch_grads(&mut self, enabled: bool) {
        self.grads_enabled = enabled;
    }

    fn forward(&self, inputs: &Tensor, capture: &mut ActivationCapture) -> fedcka_core::Result<Tensor> {
        let x = inputs
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| FedCkaError::ShapeMismatch {
                name: "inputs".to_string(),
                expected: vec![inputs.shape().first().copied().unwrap_or(0), self.fc1_weight.nrows()],
                actual: inputs.shape().to_vec(),
            })?
            .to_owned();
        let cache = self.forward_cached(&x)?;
        capture.record(LAYER_NAMES[0], &cache.z1.into_dyn())?;
        capture.record(LAYER_NAMES[1], &cache.h.into_dyn())?;
        let logits = cache.logits.into_dyn();
        capture.record(LAYER_NAMES[2], &logits)?;
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> Mlp {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        Mlp::new(3, 5, 2, &mut rng)
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let m = model();
        let x = arr2(&[[0.5f32, -0.3, 0.8], [-0.2, 0.9, 0.1]]);
        let labels = [1, 0];
        let (_, grad) = m.loss_and_grad(&x, &labels, true).unwrap();
        let grad = grad.unwrap();

        let eps = 1e-3f32;
        for (p, name) in PARAM_NAMES.iter().enumerate() {
            let state = m.state();
            let base = state.get(name).unwrap().clone();
            // probe the first couple of entries of every parameter
            for k in 0..base.len().min(2) {
                let mut plus = state.clone();
                let mut minus = state.clone();
                plus.get_mut(name).unwrap().as_slice_mut().unwrap()[k] += eps;
                minus.get_mut(name).unwrap().as_slice_mut().unwrap()[k] -= eps;

                let mut mp = m.clone();
                mp.load_state(&plus).unwrap();
                let mut mm = m.clone();
                mm.load_state(&minus).unwrap();
                let lp = mp.loss_and_grad(&x, &labels, false).unwrap().0;
                let lm = mm.loss_and_grad(&x, &labels, false).unwrap().0;
                let numeric = (lp - lm) / (2.0 * f64::from(eps));
                let analytic = f64::from(grad[p].as_slice().unwrap()[k]);
                assert!((numeric - analytic).abs() < 1e-2, "{name}[{k}]: {numeric} vs {analytic}");
            }
        }
    }

    #[test]
    fn test_sgd_reduces_loss() {
        let mut m = model();
        let x = arr2(&[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let labels = [0, 1, 0];
        let (before, _) = m.loss_and_grad(&x, &labels, false).unwrap();
        for _ in 0..200 {
            let (_, g) = m.loss_and_grad(&x, &labels, true).unwrap();
            m.apply_gradient(&g.unwrap(), 0.5).unwrap();
        }
        let (after, _) = m.loss_and_grad(&x, &labels, false).unwrap();
        assert!(after < before);
        assert_eq!(m.predict(&x).unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_frozen_model_ignores_steps() {
        let mut m = model();
        let before = m.state();
        m.switch_grads(false);
        let (_, g) = m
            .loss_and_grad(&arr2(&[[1.0f32, 2.0, 3.0]]), &[1], true)
            .unwrap();
        m.apply_gradient(&g.unwrap(), 1.0).unwrap();
        assert_eq!(m.state(), before);
    }

    #[test]
    fn test_load_state_is_strict() {
        let mut m = model();
        let mut state = m.state();
        state.insert("fc3.weight", Array2::<f32>::zeros((1, 1)).into_dyn());
        assert!(matches!(m.load_state(&state), Err(FedCkaError::UnexpectedParameter(_))));

        let mut state = model().state();
        state.insert("fc1.bias", Array1::<f32>::zeros(4).into_dyn());
        assert!(matches!(m.load_state(&state), Err(FedCkaError::ShapeMismatch { .. })));
        // failed loads leave the model usable and unchanged
        assert_eq!(m.state(), model().state());
    }

    #[test]
    fn test_forward_captures_every_layer() {
        let m = model();
        let mut capture = ActivationCapture::new(&LAYER_NAMES);
        let x = arr2(&[[0.1f32, 0.2, 0.3], [0.4, 0.5, 0.6]]).into_dyn();
        let out = m.forward(&x, &mut capture).unwrap();
        let acts = capture.finish().unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(acts["fc1"].shape(), &[2, 5]);
        assert!(acts["relu"].iter().all(|&v| v >= 0.0));
        assert_eq!(acts["fc2"], out.into_dimensionality::<Ix2>().unwrap());
    }
}
