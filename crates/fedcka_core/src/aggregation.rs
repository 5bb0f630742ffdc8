//! Pluggable aggregation of submitted client models.
//!
//! - Plain FedAvg (baseline)
//! - FedAvg behind CKA filtering, see [`crate::defence`]

use ndarray::Array2;

use crate::error::{FedCkaError, Result};
use crate::representation::Model;
use crate::defence::FedAvgCka;
use crate::tensor::{average_updates, ClientUpdate};

/// Trait for pluggable aggregation strategies
///
/// Implementations keep their configuration in struct fields and hold no
/// per-round state.
pub trait Aggregator {
    /// Combine one round of submitted models into a single model
    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<AggregationResult>;

    /// Human-readable name for logging/debugging
    fn name(&self) -> &'static str;
}

/// Result of aggregation
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub aggregated: ClientUpdate,
    /// Indices of updates that contributed to the aggregate
    pub selected_indices: Vec<usize>,
    /// Indices of updates that were filtered out
    pub rejected_indices: Vec<usize>,
    /// Pairwise similarity, for aggregators that compute one
    pub similarity: Option<Array2<f64>>,
}

/// FedAvg (simple mean) aggregator
#[derive(Clone, Debug, Default)]
pub struct FedAvgAggregator;

impl Aggregator for FedAvgAggregator {
    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<AggregationResult> {
        if updates.is_empty() {
            return Err(FedCkaError::EmptyUpdates);
        }
        let refs: Vec<&ClientUpdate> = updates.iter().collect();
        Ok(AggregationResult {
            aggregated: average_updates(&refs)?,
            selected_indices: (0..updates.len()).collect(),
            rejected_indices: Vec::new(),
            similarity: None,
        })
    }

    fn name(&self) -> &'static str {
        "FedAvg"
    }
}

impl<M: Model> Aggregator for FedAvgCka<M> {
    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<AggregationResult> {
        let filtered = self.filter_and_aggregate(updates)?;
        let rejected_indices = filtered.rejected_indices();
        Ok(AggregationResult {
            aggregated: filtered.aggregated,
            selected_indices: filtered.kept_indices,
            rejected_indices,
            similarity: Some(filtered.similarity),
        })
    }

    fn name(&self) -> &'static str {
        "FedAvgCKA"
    }
}
