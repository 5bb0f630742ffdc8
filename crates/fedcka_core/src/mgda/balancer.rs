//! Turns several task losses into one blind loss.
//!
//! Per step the balancer decides which tasks are active, asks the objective
//! for losses (and gradients when MGDA needs them), derives one scale per
//! task and records the main-task loss in the caller's [`LossHistory`].

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::{BalanceConfig, LossBalance};
use crate::error::{FedCkaError, Result};
use crate::mgda::history::LossHistory;
use crate::mgda::normalizer::{gradient_normalizers, NormalizationMode};
use crate::mgda::solver::find_min_norm_element;
use crate::task::LossTask;
use crate::tensor::{l2_norm, TaskGradient};

/// Added to every normalizer before dividing a gradient by it
const NORMALIZER_EPS: f64 = 1e-5;

/// Losses and optional gradients returned by a [`TaskObjective`].
#[derive(Debug, Clone, Default)]
pub struct TaskEvaluation {
    /// Batch-mean loss per task
    pub losses: BTreeMap<LossTask, f64>,
    /// Parameter gradients per task (empty when not requested)
    pub grads: BTreeMap<LossTask, TaskGradient>,
}

/// Computes per-task losses for one batch on behalf of the balancer.
pub trait TaskObjective {
    fn evaluate(&mut self, tasks: &[LossTask], compute_grad: bool) -> Result<TaskEvaluation>;
}

/// Outcome of one balanced step.
#[derive(Debug, Clone)]
pub struct BalancedLoss {
    pub tasks: Vec<LossTask>,
    pub evaluation: TaskEvaluation,
    pub scales: BTreeMap<LossTask, f64>,
    /// `sum_t scale_t * loss_t`
    pub blind_loss: f64,
}

impl BalancedLoss {
    /// Gradient of the blind loss, `sum_t scale_t * grad_t`.
    ///
    /// Requires the evaluation to carry a gradient for every active task.
    pub fn combined_gradient(&self) -> Result<TaskGradient> {
        let mut combined: Option<TaskGradient> = None;
        for task in &self.tasks {
            let grad = self
                .evaluation
                .grads
                .get(task)
                .ok_or_else(|| missing(*task, "gradient"))?;
            let scale = self.scales[task] as f32;
            match combined.as_mut() {
                None => combined = Some(grad.iter().map(|g| g * scale).collect()),
                Some(acc) => {
                    if acc.len() != grad.len() {
                        return Err(FedCkaError::GradientLengthMismatch {
                            expected: acc.len(),
                            actual: grad.len(),
                        });
                    }
                    for (k, (a, g)) in acc.iter_mut().zip(grad).enumerate() {
                        crate::tensor::check_shape(&format!("{task}[{k}]"), a, g)?;
                        a.scaled_add(scale, g);
                    }
                }
            }
        }
        combined.ok_or(FedCkaError::TooFewTasks(0))
    }
}

fn missing(task: LossTask, kind: &'static str) -> FedCkaError {
    FedCkaError::MissingTask {
        task: task.to_string(),
        kind,
    }
}

/// MGDA scales: normalize each task gradient, solve for the min-norm
/// convex combination, and map the weights back onto task names.
pub fn get_scales(
    grads: &BTreeMap<LossTask, TaskGradient>,
    losses: &BTreeMap<LossTask, f64>,
    normalization: NormalizationMode,
    tasks: &[LossTask],
) -> Result<BTreeMap<LossTask, f64>> {
    let gn = gradient_normalizers(grads, losses, normalization)?;

    let normalized = tasks
        .iter()
        .map(|task| {
            let grad = grads.get(task).ok_or_else(|| missing(*task, "gradient"))?;
            let divisor = (gn[task] + NORMALIZER_EPS) as f32;
            Ok(grad.iter().map(|g| g / divisor).collect::<TaskGradient>())
        })
        .collect::<Result<Vec<_>>>()?;

    let solution = find_min_norm_element(&normalized)?;
    debug!(
        tasks = ?tasks,
        weights = ?solution.weights.as_slice(),
        cost = solution.cost,
        "MGDA scales"
    );

    Ok(tasks
        .iter()
        .zip(solution.weights.iter())
        .map(|(task, &w)| (*task, w))
        .collect())
}

/// Per-step loss balancing policy.
#[derive(Debug, Clone)]
pub struct LossBalancer {
    config: BalanceConfig,
}

impl LossBalancer {
    pub fn new(config: BalanceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    /// A history sized for this balancer's threshold gating.
    pub fn new_history(&self) -> LossHistory {
        LossHistory::new(self.config.history_capacity)
    }

    /// Tasks to optimise on this step.
    ///
    /// Honest steps train `normal` only. Attacking steps use the configured
    /// tasks, except while the loss window is not yet full or its mean is
    /// still at or above `loss_threshold`.
    pub fn active_tasks(&self, history: &LossHistory, attack: bool) -> Vec<LossTask> {
        if !attack {
            return vec![LossTask::Normal];
        }
        if let Some(threshold) = self.config.loss_threshold {
            let warming_up = history.len() < self.config.history_capacity;
            let above = history.mean().map_or(true, |mean| mean >= threshold);
            if warming_up || above {
                return vec![LossTask::Normal];
            }
        }
        self.config.loss_tasks.clone()
    }

    /// Evaluate one batch and combine its task losses into the blind loss.
    ///
    /// Gradients are requested from the objective when MGDA needs them or
    /// when `backward` is set because the caller trains on the result.
    pub fn step<O>(
        &self,
        objective: &mut O,
        history: &mut LossHistory,
        attack: bool,
        backward: bool,
    ) -> Result<BalancedLoss>
    where
        O: TaskObjective + ?Sized,
    {
        let tasks = self.active_tasks(history, attack);

        let (evaluation, scales) = if tasks.len() == 1 {
            let evaluation = objective.evaluate(&tasks, backward)?;
            (evaluation, BTreeMap::from([(tasks[0], 1.0)]))
        } else {
            match self.config.loss_balance {
                LossBalance::Mgda => {
                    let evaluation = objective.evaluate(&tasks, true)?;
                    warn_on_exploding_gradients(&evaluation);
                    let scales = get_scales(
                        &evaluation.grads,
                        &evaluation.losses,
                        self.config.mgda_normalize,
                        &tasks,
                    )?;
                    (evaluation, scales)
                }
                LossBalance::Fixed => {
                    let evaluation = objective.evaluate(&tasks, backward)?;
                    let scales = tasks
                        .iter()
                        .map(|task| {
                            self.config
                                .fixed_scales
                                .get(task)
                                .map(|&s| (*task, s))
                                .ok_or_else(|| missing(*task, "fixed scale"))
                        })
                        .collect::<Result<BTreeMap<_, _>>>()?;
                    (evaluation, scales)
                }
            }
        };

        for (task, loss) in &evaluation.losses {
            if !loss.is_finite() {
                warn!(task = %task, loss, "Non-finite task loss");
            }
        }

        let normal = *evaluation
            .losses
            .get(&LossTask::Normal)
            .ok_or_else(|| missing(LossTask::Normal, "loss"))?;
        history.push(normal);

        let mut blind_loss = 0.0;
        for task in &tasks {
            let loss = evaluation
                .losses
                .get(task)
                .ok_or_else(|| missing(*task, "loss"))?;
            blind_loss += scales[task] * loss;
        }
        if !blind_loss.is_finite() {
            warn!(blind_loss, scales = ?scales, "Blind loss is not finite");
        }

        Ok(BalancedLoss {
            tasks,
            evaluation,
            scales,
            blind_loss,
        })
    }
}

fn warn_on_exploding_gradients(evaluation: &TaskEvaluation) {
    for (task, grad) in &evaluation.grads {
        let norm = l2_norm(grad);
        if !norm.is_finite() {
            warn!(task = %task, norm, "Gradient exploded");
        }
    }
}
