//! Backdoor batch synthesis.

use crate::config::BackdoorConfig;
use crate::data::Batch;

/// Produces poisoned variants of clean batches.
pub trait Synthesizer {
    /// Poison part of `batch` (all of it when `test` is set). Without
    /// `attack` the batch is returned unchanged.
    fn make_backdoor_batch(&self, batch: &Batch, test: bool, attack: bool) -> Batch;
}

/// Stamps a fixed value onto chosen input features and relabels the
/// poisoned rows to the target class.
#[derive(Debug, Clone)]
pub struct PatternSynthesizer {
    trigger_features: Vec<usize>,
    trigger_value: f32,
    backdoor_label: usize,
    poisoning_proportion: f64,
}

impl PatternSynthesizer {
    pub fn new(config: &BackdoorConfig) -> Self {
        Self {
            trigger_features: config.trigger_features.clone(),
            trigger_value: config.trigger_value,
            backdoor_label: config.backdoor_label,
            poisoning_proportion: config.poisoning_proportion,
        }
    }

    pub fn backdoor_label(&self) -> usize {
        self.backdoor_label
    }

    /// Rows poisoned in a training batch of `len` rows.
    pub fn poisoned_rows(&self, len: usize) -> usize {
        ((len as f64 * self.poisoning_proportion).round() as usize).min(len)
    }

    fn apply(&self, batch: &mut Batch, rows: usize) {
        for i in 0..rows {
            let mut row = batch.inputs.row_mut(i);
            for &f in &self.trigger_features {
                if let Some(v) = row.get_mut(f) {
                    *v = self.trigger_value;
                }
            }
            batch.labels[i] = self.backdoor_label;
        }
    }
}

impl Synthesizer for PatternSynthesizer {
    fn make_backdoor_batch(&self, batch: &Batch, test: bool, attack: bool) -> Batch {
        let mut poisoned = batch.clone();
        if !attack {
            return poisoned;
        }
        let rows = if test {
            batch.len()
        } else {
            self.poisoned_rows(batch.len())
        };
        self.apply(&mut poisoned, rows);
        poisoned
    }
}
