//! Error type shared by every fedcka_core module.

use thiserror::Error;

/// Errors raised by the balancing, extraction and defence pipeline.
///
/// Configuration and shape errors are fatal for a run. Numerical
/// degeneracies are absorbed where they occur and never show up here.
#[derive(Debug, Error)]
pub enum FedCkaError {
    #[error("invalid normalization type `{0}` (expected l2, loss, loss+, none or eq)")]
    InvalidNormalization(String),

    #[error("invalid loss balance `{0}`, choose between `MGDA` and `fixed`")]
    InvalidBalanceMode(String),

    #[error("unknown loss task `{0}`")]
    UnknownTask(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("unexpected parameter `{0}`")]
    UnexpectedParameter(String),

    #[error("gradient sets differ in length: {expected} tensors vs {actual}")]
    GradientLengthMismatch { expected: usize, actual: usize },

    #[error("unknown layer `{0}`")]
    UnknownLayer(String),

    #[error("layer `{0}` produced no activations")]
    EmptyCapture(String),

    #[error("activation matrices disagree on reference rows: {0} vs {1}")]
    RowMismatch(usize, usize),

    #[error("missing {kind} for task `{task}`")]
    MissingTask { task: String, kind: &'static str },

    #[error("min-norm solve needs at least 2 task gradients, got {0}")]
    TooFewTasks(usize),

    #[error("no client updates to aggregate")]
    EmptyUpdates,

    #[error("reference set is empty")]
    EmptyReference,
}

pub type Result<T> = std::result::Result<T, FedCkaError>;
