//! Parameter tensors, per-task gradients and client updates.
//!
//! Everything the solver and the defence touch is a named or ordered set of
//! `f32` tensors. Inner products and averages are accumulated in `f64` so
//! that reductions over many parameters stay stable.

use std::collections::btree_map;
use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};

use crate::error::{FedCkaError, Result};

/// A single parameter (or gradient) tensor of arbitrary rank.
pub type Tensor = ArrayD<f32>;

/// Gradients of one task, one tensor per trainable parameter, in parameter order.
pub type TaskGradient = Vec<Tensor>;

/// Model weights or a weight delta for one client in one round.
///
/// Keys are parameter names. The map is ordered so every iteration over an
/// update (flattening, averaging, CSV export) visits parameters identically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientUpdate {
    params: BTreeMap<String, Tensor>,
}

impl ClientUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.params.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.params.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar entries across all parameters.
    pub fn numel(&self) -> usize {
        self.params.values().map(|t| t.len()).sum()
    }

    /// Check that `other` carries exactly the same parameter names and shapes.
    pub fn check_compatible(&self, other: &ClientUpdate) -> Result<()> {
        for (name, tensor) in &self.params {
            let theirs = other
                .params
                .get(name)
                .ok_or_else(|| FedCkaError::MissingParameter(name.clone()))?;
            check_shape(name, tensor, theirs)?;
        }
        if let Some(extra) = other.names().find(|n| !self.params.contains_key(*n)) {
            return Err(FedCkaError::UnexpectedParameter(extra.to_string()));
        }
        Ok(())
    }

    /// Multiply every parameter in place (model-replacement boosting).
    pub fn scale(&mut self, factor: f32) {
        for tensor in self.params.values_mut() {
            tensor.mapv_inplace(|v| v * factor);
        }
    }

    /// `self - other`, parameter-wise.
    pub fn delta_from(&self, other: &ClientUpdate) -> Result<ClientUpdate> {
        self.check_compatible(other)?;
        let params = self
            .params
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor - &other.params[name]))
            .collect();
        Ok(Self { params })
    }

    /// `self += factor * other`, parameter-wise.
    pub fn add_scaled(&mut self, other: &ClientUpdate, factor: f32) -> Result<()> {
        self.check_compatible(other)?;
        for (name, tensor) in self.params.iter_mut() {
            tensor.scaled_add(factor, &other.params[name]);
        }
        Ok(())
    }

    pub fn l2_norm(&self) -> f64 {
        self.params
            .values()
            .map(squared_norm_of)
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.params
            .values()
            .all(|t| t.iter().all(|v| v.is_finite()))
    }
}

impl FromIterator<(String, Tensor)> for ClientUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, Tensor>> for ClientUpdate {
    fn from(params: BTreeMap<String, Tensor>) -> Self {
        Self { params }
    }
}

impl IntoIterator for ClientUpdate {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClientUpdate {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

pub(crate) fn check_shape(name: &str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(FedCkaError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }
    Ok(())
}

fn squared_norm_of(tensor: &Tensor) -> f64 {
    tensor.iter().map(|&v| f64::from(v) * f64::from(v)).sum()
}

/// Dot product of two gradient sets, as if each were flattened and concatenated.
pub fn dot(a: &[Tensor], b: &[Tensor]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(FedCkaError::GradientLengthMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    let mut total = 0.0f64;
    for (k, (ta, tb)) in a.iter().zip(b).enumerate() {
        check_shape(&format!("grad[{k}]"), ta, tb)?;
        total += ta
            .iter()
            .zip(tb.iter())
            .map(|(&x, &y)| f64::from(x) * f64::from(y))
            .sum::<f64>();
    }
    Ok(total)
}

/// L2 norm of the concatenation of all tensors in a gradient set.
pub fn l2_norm(grads: &[Tensor]) -> f64 {
    grads.iter().map(squared_norm_of).sum::<f64>().sqrt()
}

/// Parameter-wise mean of a non-empty set of compatible updates.
///
/// The running sum is kept in `f64`, so averaging `m` identical updates
/// reproduces the input bit for bit.
pub fn average_updates(updates: &[&ClientUpdate]) -> Result<ClientUpdate> {
    let first = updates.first().ok_or(FedCkaError::EmptyUpdates)?;
    for other in &updates[1..] {
        first.check_compatible(other)?;
    }

    let count = updates.len() as f64;
    let params = first
        .iter()
        .map(|(name, tensor)| {
            let mut acc = ArrayD::<f64>::zeros(tensor.raw_dim());
            for update in updates {
                Zip::from(&mut acc)
                    .and(&update.params[name])
                    .for_each(|a, &v| *a += f64::from(v));
            }
            (name.clone(), acc.mapv(|a| (a / count) as f32))
        })
        .collect();
    Ok(ClientUpdate { params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn update(w: f32, b: f32) -> ClientUpdate {
        let mut u = ClientUpdate::new();
        u.insert("fc.weight", arr2(&[[w, w], [w, w]]).into_dyn());
        u.insert("fc.bias", arr1(&[b, b]).into_dyn());
        u
    }

    #[test]
    fn test_dot_spans_all_tensors() {
        let a = vec![arr1(&[1.0f32, 2.0]).into_dyn(), arr1(&[3.0f32]).into_dyn()];
        let b = vec![arr1(&[4.0f32, 5.0]).into_dyn(), arr1(&[6.0f32]).into_dyn()];
        assert_eq!(dot(&a, &b).unwrap(), 4.0 + 10.0 + 18.0);
    }

    #[test]
    fn test_dot_rejects_shape_mismatch() {
        let a = vec![arr1(&[1.0f32, 2.0]).into_dyn()];
        let b = vec![arr1(&[1.0f32, 2.0, 3.0]).into_dyn()];
        assert!(matches!(
            dot(&a, &b),
            Err(FedCkaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_average_identical_updates_is_exact() {
        let u = update(0.1, -0.3);
        let avg = average_updates(&[&u, &u, &u]).unwrap();
        assert_eq!(avg, u);
    }

    #[test]
    fn test_average_mean() {
        let a = update(1.0, 2.0);
        let b = update(3.0, 4.0);
        let avg = average_updates(&[&a, &b]).unwrap();
        assert_eq!(avg.get("fc.weight").unwrap()[[0, 1]], 2.0);
        assert_eq!(avg.get("fc.bias").unwrap()[[1]], 3.0);
    }

    #[test]
    fn test_average_rejects_missing_parameter() {
        let a = update(1.0, 2.0);
        let mut b = update(1.0, 2.0);
        b.params.remove("fc.bias");
        assert!(matches!(
            average_updates(&[&a, &b]),
            Err(FedCkaError::MissingParameter(name)) if name == "fc.bias"
        ));
    }

    #[test]
    fn test_delta_and_add_scaled() {
        let global = update(1.0, 1.0);
        let local = update(1.5, 0.5);
        let delta = local.delta_from(&global).unwrap();
        assert_eq!(delta.get("fc.bias").unwrap()[[0]], -0.5);

        let mut rebuilt = global.clone();
        rebuilt.add_scaled(&delta, 1.0).unwrap();
        assert_eq!(rebuilt, local);
    }

    #[test]
    fn test_scale_and_norm() {
        let mut u = update(1.0, 0.0);
        u.scale(2.0);
        // four weights of 2.0 -> sqrt(16)
        assert!((u.l2_norm() - 4.0).abs() < 1e-12);
        assert!(u.is_finite());
    }
}
