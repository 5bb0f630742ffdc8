//! # fedcka_core
//!
//! Building blocks for studying backdoor attacks and defences in federated
//! learning:
//!
//! - [`mgda`]: gradient normalizers, the min-norm (MGDA) solver and the loss
//!   balancer an attacker uses to blend a backdoor objective into training.
//! - [`representation`] and [`cka`]: activation extraction on a fixed
//!   reference set and linear CKA between activation matrices.
//! - [`defence`] and [`aggregation`]: FedAvg behind CKA filtering, and the
//!   aggregator seam the round driver plugs into.

pub mod aggregation;
pub mod cka;
pub mod config;
pub mod defence;
pub mod error;
pub mod mgda;
pub mod representation;
pub mod task;
pub mod tensor;

pub use aggregation::{AggregationResult, Aggregator, FedAvgAggregator};
pub use cka::{heatmap_range, layerwise_similarity, linear_cka, similarity_matrix};
pub use config::{BalanceConfig, DefenceConfig, LossBalance};
pub use defence::{select_survivors, CkaFiltered, FedAvgCka, Selection};
pub use error::{FedCkaError, Result};
pub use mgda::{
    find_min_norm_element, BalancedLoss, LossBalancer, LossHistory, MinNormSolution,
    NormalizationMode, TaskEvaluation, TaskObjective,
};
pub use representation::{
    ActivationCapture, Activations, Model, ReferenceSet, RepresentationExtractor,
};
pub use task::LossTask;
pub use tensor::{ClientUpdate, TaskGradient, Tensor};
