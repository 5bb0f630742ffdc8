//! Experiment configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use fedcka_core::{BalanceConfig, DefenceConfig};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SimError};
use crate::model::LAYER_NAMES;

/// Shape of the synthetic classification problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_samples_per_client")]
    pub samples_per_client: usize,
    #[serde(default = "default_test_size")]
    pub test_size: usize,
    /// Clean server-side samples the CKA reference set is drawn from
    #[serde(default = "default_root_size")]
    pub root_size: usize,
    /// Spread of samples around their class centre
    #[serde(default = "default_noise")]
    pub noise: f32,
}

fn default_features() -> usize {
    16
}
fn default_classes() -> usize {
    4
}
fn default_samples_per_client() -> usize {
    128
}
fn default_test_size() -> usize {
    256
}
fn default_root_size() -> usize {
    128
}
fn default_noise() -> f32 {
    0.5
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            features: default_features(),
            classes: default_classes(),
            samples_per_client: default_samples_per_client(),
            test_size: default_test_size(),
            root_size: default_root_size(),
            noise: default_noise(),
        }
    }
}

/// Local optimisation settings shared by every client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Inputs are clamped to `[lo, hi]` before every step
    #[serde(default)]
    pub clip_batch: Option<(f32, f32)>,
    /// Report running losses and scales every this many batches
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

fn default_hidden() -> usize {
    32
}
fn default_lr() -> f32 {
    0.1
}
fn default_batch_size() -> usize {
    32
}
fn default_log_interval() -> usize {
    100
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            lr: default_lr(),
            batch_size: default_batch_size(),
            clip_batch: None,
            log_interval: default_log_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlConfig {
    #[serde(default = "default_total_participants")]
    pub fl_total_participants: usize,
    /// Participants sampled per round
    #[serde(default = "default_no_models")]
    pub fl_no_models: usize,
    #[serde(default = "default_local_epochs")]
    pub fl_local_epochs: usize,
    /// Participants `0..fl_number_of_adversaries` are compromised
    #[serde(default)]
    pub fl_number_of_adversaries: usize,
    /// Factor applied to a compromised participant's update
    #[serde(default = "default_weight_scale")]
    pub fl_weight_scale: f32,
    /// Server learning rate towards the aggregate
    #[serde(default = "default_eta")]
    pub fl_eta: f32,
}

fn default_total_participants() -> usize {
    10
}
fn default_no_models() -> usize {
    5
}
fn default_local_epochs() -> usize {
    1
}
fn default_weight_scale() -> f32 {
    1.0
}
fn default_eta() -> f32 {
    1.0
}

impl Default for FlConfig {
    fn default() -> Self {
        Self {
            fl_total_participants: default_total_participants(),
            fl_no_models: default_no_models(),
            fl_local_epochs: default_local_epochs(),
            fl_number_of_adversaries: 0,
            fl_weight_scale: default_weight_scale(),
            fl_eta: default_eta(),
        }
    }
}

/// Pixel-pattern style trigger stamped onto input features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackdoorConfig {
    #[serde(default = "default_trigger_features")]
    pub trigger_features: Vec<usize>,
    #[serde(default = "default_trigger_value")]
    pub trigger_value: f32,
    #[serde(default)]
    pub backdoor_label: usize,
    /// Fraction of every training batch that gets poisoned
    #[serde(default = "default_poisoning_proportion")]
    pub poisoning_proportion: f64,
}

fn default_trigger_features() -> Vec<usize> {
    vec![0, 1, 2]
}
fn default_trigger_value() -> f32 {
    3.0
}
fn default_poisoning_proportion() -> f64 {
    0.5
}

impl Default for BackdoorConfig {
    fn default() -> Self {
        Self {
            trigger_features: default_trigger_features(),
            trigger_value: default_trigger_value(),
            backdoor_label: 0,
            poisoning_proportion: default_poisoning_proportion(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `fedcka_core=debug`
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory for round CSVs and similarity matrices; nothing is written when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Also export a similarity matrix per configured defence layer each round
    #[serde(default)]
    pub layerwise: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub seed: u64,
    /// Rounds (or centralized epochs) to run after the baseline evaluation
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Train the global model on the pooled participant data instead of
    /// running federated rounds
    #[serde(default)]
    pub centralized: bool,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub fl: FlConfig,
    #[serde(default)]
    pub backdoor: BackdoorConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default = "default_defence", deserialize_with = "deserialize_defence")]
    pub defence: DefenceConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

fn default_epochs() -> usize {
    5
}

fn default_defence_layers() -> Vec<String> {
    vec!["relu".to_string(), "fc1".to_string(), "fc2".to_string()]
}

/// Defence probing the hidden activations of the reference classifier
fn default_defence() -> DefenceConfig {
    DefenceConfig {
        layers: default_defence_layers(),
        ..DefenceConfig::default()
    }
}

/// `[defence]` as written in a file. Omitted fields fall back per field,
/// with layers defaulting to the simulated classifier's.
#[derive(Deserialize)]
struct DefenceSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_defence_layers")]
    layers: Vec<String>,
    #[serde(default)]
    ref_size: Option<usize>,
    #[serde(default)]
    discard_ratio: Option<f64>,
}

fn deserialize_defence<'de, D>(deserializer: D) -> core::result::Result<DefenceConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let section = DefenceSection::deserialize(deserializer)?;
    let base = DefenceConfig::default();
    Ok(DefenceConfig {
        enabled: section.enabled,
        layers: section.layers,
        ref_size: section.ref_size.unwrap_or(base.ref_size),
        discard_ratio: section.discard_ratio.unwrap_or(base.discard_ratio),
    })
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            epochs: default_epochs(),
            centralized: false,
            data: DataConfig::default(),
            train: TrainConfig::default(),
            fl: FlConfig::default(),
            backdoor: BackdoorConfig::default(),
            balance: BalanceConfig::default(),
            defence: default_defence(),
            log: LogConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SimConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.balance.validate()?;
        self.defence.validate()?;

        let d = &self.data;
        if d.features == 0 || d.classes < 2 {
            return Err(SimError::Config(format!(
                "need at least one feature and two classes, got {} and {}",
                d.features, d.classes
            )));
        }
        if d.samples_per_client == 0 || d.test_size == 0 || d.root_size == 0 {
            return Err(SimError::Config("dataset sizes must be positive".to_string()));
        }

        if let Some(layer) = self.defence.layers.iter().find(|l| !LAYER_NAMES.contains(&l.as_str())) {
            return Err(SimError::Config(format!(
                "defence layer {layer:?} is not one of {LAYER_NAMES:?}"
            )));
        }
        if self.defence.enabled && self.defence.ref_size > d.root_size {
            return Err(SimError::Config(format!(
                "defence ref_size {} exceeds root_size {}",
                self.defence.ref_size, d.root_size
            )));
        }
        if self.train.hidden == 0 || self.train.batch_size == 0 || self.train.log_interval == 0 {
            return Err(SimError::Config(
                "hidden, batch_size and log_interval must be positive".to_string(),
            ));
        }
        if let Some((lo, hi)) = self.train.clip_batch {
            if lo > hi {
                return Err(SimError::Config(format!("clip_batch bounds reversed: ({lo}, {hi})")));
            }
        }

        let fl = &self.fl;
        if fl.fl_no_models == 0 || fl.fl_no_models > fl.fl_total_participants {
            return Err(SimError::Config(format!(
                "fl_no_models must lie in 1..={}, got {}",
                fl.fl_total_participants, fl.fl_no_models
            )));
        }
        if fl.fl_number_of_adversaries > fl.fl_total_participants {
            return Err(SimError::Config(format!(
                "{} adversaries among {} participants",
                fl.fl_number_of_adversaries, fl.fl_total_participants
            )));
        }

        let b = &self.backdoor;
        if b.backdoor_label >= d.classes {
            return Err(SimError::Config(format!(
                "backdoor_label {} outside {} classes",
                b.backdoor_label, d.classes
            )));
        }
        if let Some(&f) = b.trigger_features.iter().find(|&&f| f >= d.features) {
            return Err(SimError::Config(format!(
                "trigger feature {f} outside {} features",
                d.features
            )));
        }
        if !(0.0..=1.0).contains(&b.poisoning_proportion) {
            return Err(SimError::Config(format!(
                "poisoning_proportion must lie in [0, 1], got {}",
                b.poisoning_proportion
            )));
        }
        Ok(())
    }
}
