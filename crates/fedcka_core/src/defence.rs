//! FedAvg with CKA filtering.
//!
//! Every submitted model is probed on the same reference set. Clients whose
//! representations agree least with the rest of the round are dropped
//! before the surviving updates are averaged.

use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::cka::{layerwise_similarity, similarity_matrix};
use crate::config::DefenceConfig;
use crate::error::{FedCkaError, Result};
use crate::representation::{Model, ReferenceSet, RepresentationExtractor};
use crate::tensor::{average_updates, ClientUpdate};

/// Quantile of `values` with linear interpolation between order statistics.
///
/// Any NaN in `values` makes the result NaN. Returns `None` for an empty
/// slice.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    if values.iter().any(|v| v.is_nan()) {
        return Some(f64::NAN);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Self-inclusive mean of each row.
pub fn row_means(sim: &Array2<f64>) -> Vec<f64> {
    sim.rows()
        .into_iter()
        .map(|row| row.sum() / row.len() as f64)
        .collect()
}

/// Clients kept for a similarity matrix and discard ratio, with the
/// per-client mean similarity and the threshold that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub kept: Vec<usize>,
    pub mean_similarity: Vec<f64>,
    pub threshold: f64,
    /// Set when no client reached the threshold and every client was kept
    pub fell_back: bool,
}

/// Keep every client whose mean similarity reaches the `discard_ratio`
/// quantile. An empty keep-set is replaced by all clients.
pub fn select_survivors(sim: &Array2<f64>, discard_ratio: f64) -> Selection {
    let mean_similarity = row_means(sim);
    let threshold = quantile(&mean_similarity, discard_ratio).unwrap_or(f64::NAN);

    let mut kept: Vec<usize> = mean_similarity
        .iter()
        .enumerate()
        .filter(|(_, mean)| **mean >= threshold)
        .map(|(i, _)| i)
        .collect();

    let fell_back = kept.is_empty() && !mean_similarity.is_empty();
    if fell_back {
        warn!(
            clients = mean_similarity.len(),
            threshold, "No client reached the CKA threshold, keeping all"
        );
        kept = (0..mean_similarity.len()).collect();
    }

    Selection {
        kept,
        mean_similarity,
        threshold,
        fell_back,
    }
}

/// Result of one filtered aggregation.
#[derive(Debug, Clone)]
pub struct CkaFiltered<'a> {
    pub kept_indices: Vec<usize>,
    pub kept_updates: Vec<&'a ClientUpdate>,
    pub aggregated: ClientUpdate,
    /// Full matrix over every submitted client, filtered ones included
    pub similarity: Array2<f64>,
    pub selection: Selection,
}

impl CkaFiltered<'_> {
    pub fn rejected_indices(&self) -> Vec<usize> {
        (0..self.similarity.nrows())
            .filter(|i| !self.kept_indices.contains(i))
            .collect()
    }
}

/// Probes client models at the configured layer and averages the ones
/// that look like the majority.
#[derive(Debug, Clone)]
pub struct FedAvgCka<M: Model> {
    extractor: RepresentationExtractor<M>,
    config: DefenceConfig,
}

impl<M: Model> FedAvgCka<M> {
    pub fn new(template: M, reference: ReferenceSet, config: DefenceConfig) -> Result<Self> {
        config.validate()?;
        let extractor = RepresentationExtractor::new(template, reference);
        extractor.check_layers(&config.layers)?;
        Ok(Self { extractor, config })
    }

    pub fn config(&self) -> &DefenceConfig {
        &self.config
    }

    pub fn extractor(&self) -> &RepresentationExtractor<M> {
        &self.extractor
    }

    /// Similarity of every pair of submitted models at the probe layer.
    pub fn similarity(&self, updates: &[ClientUpdate]) -> Result<Array2<f64>> {
        let layer = [self.config.probe_layer()];
        let activations = updates
            .iter()
            .map(|update| {
                let mut acts = self.extractor.extract(update, &layer)?;
                acts.remove(layer[0])
                    .ok_or_else(|| FedCkaError::EmptyCapture(layer[0].to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<_> = activations.iter().collect();
        similarity_matrix(&refs)
    }

    /// Extract, score, filter and average one round of submitted models.
    pub fn filter_and_aggregate<'a>(&self, updates: &'a [ClientUpdate]) -> Result<CkaFiltered<'a>> {
        if updates.is_empty() {
            return Err(FedCkaError::EmptyUpdates);
        }

        let similarity = self.similarity(updates)?;
        let selection = select_survivors(&similarity, self.config.discard_ratio);
        debug!(
            means = ?selection.mean_similarity,
            threshold = selection.threshold,
            "CKA mean similarity"
        );

        let kept_updates: Vec<&ClientUpdate> =
            selection.kept.iter().map(|&i| &updates[i]).collect();
        let aggregated = average_updates(&kept_updates)?;

        info!(
            clients = updates.len(),
            kept = selection.kept.len(),
            layer = self.config.probe_layer(),
            fell_back = selection.fell_back,
            "CKA filtering done"
        );

        Ok(CkaFiltered {
            kept_indices: selection.kept.clone(),
            kept_updates,
            aggregated,
            similarity,
            selection,
        })
    }

    /// One similarity matrix per configured layer, for diagnostics.
    pub fn layerwise_similarity(&self, updates: &[ClientUpdate]) -> Result<BTreeMap<String, Array2<f64>>> {
        let activations = updates
            .iter()
            .map(|update| self.extractor.extract(update, &self.config.layers))
            .collect::<Result<Vec<_>>>()?;
        layerwise_similarity(&activations, &self.config.layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_quantile_interpolates() {
        let v = [3.0, 1.0, 4.0, 2.0];
        assert_eq!(quantile(&v, 0.0), Some(1.0));
        assert_eq!(quantile(&v, 1.0), Some(4.0));
        assert_eq!(quantile(&v, 0.5), Some(2.5));
        assert_eq!(quantile(&[7.0], 0.3), Some(7.0));
        assert_eq!(quantile(&[], 0.5), None);
        assert!(quantile(&[1.0, f64::NAN], 0.5).unwrap().is_nan());
    }

    #[test]
    fn test_median_drops_lowest_of_three() {
        let sim = arr2(&[[1.0, 0.2, 0.6], [0.2, 1.0, 0.5], [0.6, 0.5, 1.0]]);
        let selection = select_survivors(&sim, 0.5);
        // means: 0.6, 0.5667, 0.7
        assert_eq!(selection.kept, vec![0, 2]);
        assert!(!selection.fell_back);
    }

    #[test]
    fn test_zero_ratio_keeps_everyone() {
        let sim = arr2(&[[1.0, 0.1], [0.1, 1.0]]);
        assert_eq!(select_survivors(&sim, 0.0).kept, vec![0, 1]);
    }

    #[test]
    fn test_nan_similarity_falls_back_to_all() {
        let sim = arr2(&[[1.0, f64::NAN, 0.4], [f64::NAN, f64::NAN, f64::NAN], [0.4, f64::NAN, 1.0]]);
        let selection = select_survivors(&sim, 0.5);
        assert!(selection.fell_back);
        assert_eq!(selection.kept, vec![0, 1, 2]);
    }

    #[test]
    fn test_ties_are_kept() {
        let sim = Array2::<f64>::ones((4, 4));
        let selection = select_survivors(&sim, 0.5);
        assert_eq!(selection.kept.len(), 4);
        assert_eq!(selection.threshold, 1.0);
    }
}
