//! Balancing and defence settings.
//!
//! Tags arrive as strings in TOML and are parsed into closed enums while
//! deserializing, so a typo in `loss_balance` or `mgda_normalize` fails
//! when the file is loaded rather than on the first training step.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FedCkaError, Result};
use crate::mgda::history::DEFAULT_HISTORY_CAPACITY;
use crate::mgda::normalizer::NormalizationMode;
use crate::task::LossTask;

/// Parse any configuration section from TOML text.
pub fn from_toml_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}

/// How per-task losses are weighted into the blind loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossBalance {
    /// Scales from the min-norm solver over normalized task gradients
    #[default]
    Mgda,
    /// Statically configured per-task scales
    Fixed,
}

impl LossBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossBalance::Mgda => "MGDA",
            LossBalance::Fixed => "fixed",
        }
    }
}

impl fmt::Display for LossBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossBalance {
    type Err = FedCkaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MGDA" => Ok(LossBalance::Mgda),
            "fixed" => Ok(LossBalance::Fixed),
            other => Err(FedCkaError::InvalidBalanceMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for LossBalance {
    type Error = FedCkaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LossBalance> for String {
    fn from(mode: LossBalance) -> Self {
        mode.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Tasks optimised by compromised clients. Must include `normal`.
    #[serde(default = "default_loss_tasks")]
    pub loss_tasks: Vec<LossTask>,
    #[serde(default)]
    pub loss_balance: LossBalance,
    #[serde(default)]
    pub mgda_normalize: NormalizationMode,
    /// Per-task factors for `fixed` balancing
    #[serde(default)]
    pub fixed_scales: BTreeMap<LossTask, f64>,
    /// Train on `normal` only until the mean recent loss drops below this
    #[serde(default)]
    pub loss_threshold: Option<f64>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_loss_tasks() -> Vec<LossTask> {
    vec![LossTask::Normal]
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            loss_tasks: default_loss_tasks(),
            loss_balance: LossBalance::default(),
            mgda_normalize: NormalizationMode::default(),
            fixed_scales: BTreeMap::new(),
            loss_threshold: None,
            history_capacity: default_history_capacity(),
        }
    }
}

impl BalanceConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.loss_tasks.contains(&LossTask::Normal) {
            return Err(FedCkaError::Config(
                "loss_tasks must include `normal`".to_string(),
            ));
        }
        let unique: BTreeSet<_> = self.loss_tasks.iter().collect();
        if unique.len() != self.loss_tasks.len() {
            return Err(FedCkaError::Config(format!(
                "loss_tasks contains duplicates: {:?}",
                self.loss_tasks
            )));
        }
        if self.loss_balance == LossBalance::Fixed {
            for task in &self.loss_tasks {
                match self.fixed_scales.get(task) {
                    Some(scale) if scale.is_finite() => {}
                    Some(scale) => {
                        return Err(FedCkaError::Config(format!(
                            "fixed scale for `{task}` is not finite: {scale}"
                        )))
                    }
                    None => {
                        return Err(FedCkaError::Config(format!(
                            "fixed balancing needs a scale for `{task}`"
                        )))
                    }
                }
            }
        }
        if let Some(threshold) = self.loss_threshold {
            if !threshold.is_finite() {
                return Err(FedCkaError::Config(format!(
                    "loss_threshold must be finite, got {threshold}"
                )));
            }
        }
        if self.history_capacity == 0 {
            return Err(FedCkaError::Config(
                "history_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for CKA-based filtering of client updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Probed layers. The first one drives filtering; all of them are used
    /// for layer-wise diagnostics.
    #[serde(default = "default_layers")]
    pub layers: Vec<String>,
    /// Number of reference examples sampled once from the root dataset
    #[serde(default = "default_ref_size")]
    pub ref_size: usize,
    /// Quantile of mean similarity under which clients are discarded
    #[serde(default = "default_discard_ratio")]
    pub discard_ratio: f64,
}

fn default_layers() -> Vec<String> {
    vec!["layer4".to_string()]
}

fn default_ref_size() -> usize {
    32
}

fn default_discard_ratio() -> f64 {
    0.5
}

impl Default for DefenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            layers: default_layers(),
            ref_size: default_ref_size(),
            discard_ratio: default_discard_ratio(),
        }
    }
}

impl DefenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() || self.layers.iter().any(|l| l.trim().is_empty()) {
            return Err(FedCkaError::Config(
                "defence needs at least one non-empty layer name".to_string(),
            ));
        }
        if self.ref_size == 0 {
            return Err(FedCkaError::Config("ref_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.discard_ratio) {
            return Err(FedCkaError::Config(format!(
                "discard_ratio must lie in [0, 1], got {}",
                self.discard_ratio
            )));
        }
        Ok(())
    }

    /// Layer whose activations decide which clients survive.
    pub fn probe_layer(&self) -> &str {
        self.layers.first().map(String::as_str).unwrap_or("layer4")
    }
}
