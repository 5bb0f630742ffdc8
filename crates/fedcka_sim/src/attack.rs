//! The attacker's side of local training.
//!
//! Compromised clients train on a blind loss that mixes the clean objective
//! with the backdoor objective, then boost their update before submitting.

use std::collections::BTreeMap;

use fedcka_core::{
    BalanceConfig, BalancedLoss, ClientUpdate, LossBalancer, LossHistory, LossTask, TaskEvaluation,
    TaskObjective,
};
use tracing::info;

use crate::data::Batch;
use crate::error::Result;
use crate::model::Mlp;
use crate::synthesizer::Synthesizer;

/// Clean and poisoned views of one batch, evaluated on one model.
struct BatchObjective<'a> {
    model: &'a Mlp,
    batch: &'a Batch,
    batch_back: &'a Batch,
}

impl TaskObjective for BatchObjective<'_> {
    fn evaluate(
        &mut self,
        tasks: &[LossTask],
        compute_grad: bool,
    ) -> fedcka_core::Result<TaskEvaluation> {
        let mut evaluation = TaskEvaluation::default();
        for &task in tasks {
            let batch = match task {
                LossTask::Normal => self.batch,
                LossTask::Backdoor => self.batch_back,
            };
            let (loss, grad) = self
                .model
                .loss_and_grad(&batch.inputs, &batch.labels, compute_grad)?;
            evaluation.losses.insert(task, loss);
            if let Some(grad) = grad {
                evaluation.grads.insert(task, grad);
            }
        }
        Ok(evaluation)
    }
}

/// Per-task losses and scales since the last report.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    losses: BTreeMap<String, Vec<f64>>,
    scales: BTreeMap<String, Vec<f64>>,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

impl RunningStats {
    pub fn record(&mut self, step: &BalancedLoss) {
        for task in &step.tasks {
            let name = task.as_str().to_string();
            if let Some(&loss) = step.evaluation.losses.get(task) {
                self.losses.entry(name.clone()).or_default().push(loss);
            }
            if let Some(&scale) = step.scales.get(task) {
                self.scales.entry(name).or_default().push(scale);
            }
        }
        self.losses
            .entry("total".to_string())
            .or_default()
            .push(step.blind_loss);
    }

    pub fn mean_losses(&self) -> BTreeMap<String, f64> {
        self.losses.iter().map(|(k, v)| (k.clone(), mean(v))).collect()
    }

    pub fn mean_scales(&self) -> BTreeMap<String, f64> {
        self.scales.iter().map(|(k, v)| (k.clone(), mean(v))).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Log the running means and start over.
    pub fn report(&mut self, epoch: usize, batch_id: usize, total_batches: usize) {
        if self.is_empty() {
            return;
        }
        info!(
            epoch,
            batch = batch_id,
            total_batches,
            losses = ?self.mean_losses(),
            scales = ?self.mean_scales(),
            "Training losses"
        );
        self.losses.clear();
        self.scales.clear();
    }
}

/// Blind-loss training policy plus update boosting.
#[derive(Debug, Clone)]
pub struct Attack<S: Synthesizer> {
    balancer: LossBalancer,
    history: LossHistory,
    synthesizer: S,
    clip_batch: Option<(f32, f32)>,
    fl_weight_scale: f32,
    running: RunningStats,
}

impl<S: Synthesizer> Attack<S> {
    pub fn new(
        balance: BalanceConfig,
        synthesizer: S,
        clip_batch: Option<(f32, f32)>,
        fl_weight_scale: f32,
    ) -> Result<Self> {
        let balancer = LossBalancer::new(balance)?;
        let history = balancer.new_history();
        Ok(Self {
            balancer,
            history,
            synthesizer,
            clip_batch,
            fl_weight_scale,
            running: RunningStats::default(),
        })
    }

    pub fn synthesizer(&self) -> &S {
        &self.synthesizer
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn running_mut(&mut self) -> &mut RunningStats {
        &mut self.running
    }

    /// Losses, scales and gradients of one training step on `model`.
    ///
    /// With `attack` off only the clean objective is used.
    pub fn compute_blind_loss(&mut self, model: &Mlp, batch: &Batch, attack: bool) -> Result<BalancedLoss> {
        let batch = batch.clip(self.clip_batch);
        let batch_back = self.synthesizer.make_backdoor_batch(&batch, false, attack);
        let mut objective = BatchObjective {
            model,
            batch: &batch,
            batch_back: &batch_back,
        };
        let step = self
            .balancer
            .step(&mut objective, &mut self.history, attack, true)?;
        self.running.record(&step);
        Ok(step)
    }

    /// Boost a compromised client's weight delta in place.
    pub fn fl_scale_update(&self, update: &mut ClientUpdate) {
        update.scale(self.fl_weight_scale);
    }
}
