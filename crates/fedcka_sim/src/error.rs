use fedcka_core::FedCkaError;
use thiserror::Error;

/// Errors raised while configuring or running a simulation.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Core(#[from] FedCkaError),

    #[error("invalid simulation config: {0}")]
    Config(String),

    #[error("failed to parse simulation config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize simulation config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to install tracing subscriber: {0}")]
    Logging(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("batch has {inputs} input rows but {labels} labels")]
    BatchMismatch { inputs: usize, labels: usize },
}

pub type Result<T> = std::result::Result<T, SimError>;
