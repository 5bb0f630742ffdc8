//! Multiple-gradient descent: normalizers, the min-norm solver and the
//! loss balancer that drives them.

pub mod balancer;
pub mod history;
pub mod normalizer;
pub mod solver;

pub use balancer::{get_scales, BalancedLoss, LossBalancer, TaskEvaluation, TaskObjective};
pub use history::{LossHistory, DEFAULT_HISTORY_CAPACITY};
pub use normalizer::{gradient_normalizers, NormalizationMode};
pub use solver::{
    find_min_norm_element, find_min_norm_element_fw, min_norm_element_from2, MinNormSolution,
    SolverAlgorithm,
};
