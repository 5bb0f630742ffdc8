//! Per-task gradient normalizers applied before the min-norm solve.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FedCkaError, Result};
use crate::task::LossTask;
use crate::tensor::{l2_norm, TaskGradient};

/// Upper bound applied to loss-based normalizers.
const LOSS_NORMALIZER_CAP: f64 = 10.0;

/// How each task's gradient is scaled before solving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NormalizationMode {
    /// L2 norm of the task's concatenated gradient
    L2,
    /// Task loss, capped at 10
    Loss,
    /// Task loss times gradient L2 norm, capped at 10
    LossPlus,
    /// Constant 1.0 (`none` or `eq`)
    #[default]
    None,
}

impl NormalizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationMode::L2 => "l2",
            NormalizationMode::Loss => "loss",
            NormalizationMode::LossPlus => "loss+",
            NormalizationMode::None => "none",
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormalizationMode {
    type Err = FedCkaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l2" => Ok(NormalizationMode::L2),
            "loss" => Ok(NormalizationMode::Loss),
            "loss+" => Ok(NormalizationMode::LossPlus),
            "none" | "eq" => Ok(NormalizationMode::None),
            other => Err(FedCkaError::InvalidNormalization(other.to_string())),
        }
    }
}

impl TryFrom<String> for NormalizationMode {
    type Error = FedCkaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NormalizationMode> for String {
    fn from(mode: NormalizationMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Compute one normalizer per task in `grads`.
///
/// `losses` holds the batch-mean loss of each task; it is only consulted by
/// the loss-based modes. Callers divide each gradient by `normalizer + 1e-5`.
pub fn gradient_normalizers(
    grads: &BTreeMap<LossTask, TaskGradient>,
    losses: &BTreeMap<LossTask, f64>,
    mode: NormalizationMode,
) -> Result<BTreeMap<LossTask, f64>> {
    let loss_of = |task: &LossTask| {
        losses.get(task).copied().ok_or(FedCkaError::MissingTask {
            task: task.to_string(),
            kind: "loss",
        })
    };

    grads
        .iter()
        .map(|(task, grad)| {
            let gn = match mode {
                NormalizationMode::L2 => l2_norm(grad),
                NormalizationMode::Loss => loss_of(task)?.min(LOSS_NORMALIZER_CAP),
                NormalizationMode::LossPlus => {
                    (loss_of(task)? * l2_norm(grad)).min(LOSS_NORMALIZER_CAP)
                }
                NormalizationMode::None => 1.0,
            };
            Ok((*task, gn))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn fixtures() -> (BTreeMap<LossTask, TaskGradient>, BTreeMap<LossTask, f64>) {
        let mut grads = BTreeMap::new();
        grads.insert(
            LossTask::Normal,
            vec![arr1(&[3.0f32]).into_dyn(), arr1(&[4.0f32]).into_dyn()],
        );
        grads.insert(LossTask::Backdoor, vec![arr1(&[0.0f32, 2.0]).into_dyn()]);
        let mut losses = BTreeMap::new();
        losses.insert(LossTask::Normal, 0.5);
        losses.insert(LossTask::Backdoor, 40.0);
        (grads, losses)
    }

    #[test]
    fn test_l2_concatenates_tensors() {
        let (grads, losses) = fixtures();
        let gn = gradient_normalizers(&grads, &losses, NormalizationMode::L2).unwrap();
        assert!((gn[&LossTask::Normal] - 5.0).abs() < 1e-12);
        assert!((gn[&LossTask::Backdoor] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_loss_modes_are_capped() {
        let (grads, losses) = fixtures();
        let gn = gradient_normalizers(&grads, &losses, NormalizationMode::Loss).unwrap();
        assert_eq!(gn[&LossTask::Normal], 0.5);
        assert_eq!(gn[&LossTask::Backdoor], 10.0);

        let gn = gradient_normalizers(&grads, &losses, NormalizationMode::LossPlus).unwrap();
        assert!((gn[&LossTask::Normal] - 2.5).abs() < 1e-12);
        assert_eq!(gn[&LossTask::Backdoor], 10.0);
    }

    #[test]
    fn test_every_valid_mode_gives_positive_normalizers() {
        let (grads, losses) = fixtures();
        for name in ["l2", "loss", "loss+", "none", "eq"] {
            let mode: NormalizationMode = name.parse().unwrap();
            let gn = gradient_normalizers(&grads, &losses, mode).unwrap();
            assert_eq!(gn.len(), 2);
            assert!(gn.values().all(|&v| v > 0.0), "mode {name} gave {gn:?}");
        }
    }

    #[test]
    fn test_invalid_mode_is_config_error() {
        assert!(matches!(
            "l1".parse::<NormalizationMode>(),
            Err(FedCkaError::InvalidNormalization(s)) if s == "l1"
        ));
    }

    #[test]
    fn test_missing_loss_reported() {
        let (grads, mut losses) = fixtures();
        losses.remove(&LossTask::Backdoor);
        assert!(matches!(
            gradient_normalizers(&grads, &losses, NormalizationMode::Loss),
            Err(FedCkaError::MissingTask { kind: "loss", .. })
        ));
    }
}
