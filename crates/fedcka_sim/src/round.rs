//! Federated round driver.
//!
//! Each round samples participants, lets every one of them train a copy of
//! the global model, collects `global + delta` from each, aggregates the
//! submissions and moves the global model towards the aggregate. In
//! centralized mode the global model instead trains directly on the pooled
//! participant data. Either way the untrained model is evaluated first as
//! epoch 0.

use std::path::Path;

use fedcka_core::cka::heatmap_range;
use fedcka_core::{
    AggregationResult, Aggregator, ClientUpdate, FedAvgAggregator, FedAvgCka, Model, ReferenceSet,
};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::attack::Attack;
use crate::config::{SimConfig, TrainConfig};
use crate::data::{ClassCentres, Dataset};
use crate::error::{Result, SimError};
use crate::metrics::{accuracy, backdoor_accuracy};
use crate::model::Mlp;
use crate::report::{write_round_reports, write_similarity_csv, write_summary_json, RoundReport};
use crate::synthesizer::{PatternSynthesizer, Synthesizer};

/// One client of the federation.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: usize,
    pub compromised: bool,
    pub data: Dataset,
}

/// Server-side aggregation rule for the run.
#[derive(Debug, Clone)]
pub enum ServerAggregator {
    FedAvg(FedAvgAggregator),
    Cka(FedAvgCka<Mlp>),
}

impl ServerAggregator {
    pub fn as_aggregator(&self) -> &dyn Aggregator {
        match self {
            ServerAggregator::FedAvg(agg) => agg,
            ServerAggregator::Cka(agg) => agg,
        }
    }

    pub fn cka(&self) -> Option<&FedAvgCka<Mlp>> {
        match self {
            ServerAggregator::Cka(agg) => Some(agg),
            ServerAggregator::FedAvg(_) => None,
        }
    }
}

/// Local SGD on the blind loss for one pass over `data`.
fn train_epoch<S: Synthesizer>(
    attack: &mut Attack<S>,
    model: &mut Mlp,
    data: &Dataset,
    train: &TrainConfig,
    epoch: usize,
    attack_on: bool,
    rng: &mut ChaCha8Rng,
) -> Result<()> {
    model.set_training(true);
    let shuffled = data.shuffled(rng);
    let total_batches = shuffled.len().div_ceil(train.batch_size);
    for (batch_id, batch) in shuffled.batches(train.batch_size).enumerate() {
        let step = attack.compute_blind_loss(model, &batch, attack_on)?;
        let grad = step.combined_gradient()?;
        model.apply_gradient(&grad, train.lr)?;
        if batch_id % train.log_interval == 0 {
            attack.running_mut().report(epoch, batch_id, total_batches);
        }
    }
    Ok(())
}

/// Report label of centralized epochs
pub const CENTRALIZED: &str = "Centralized";

/// Whole experiment state, owned by a single driver.
pub struct Simulation {
    config: SimConfig,
    global: Mlp,
    participants: Vec<Participant>,
    /// Every participant's data, built only in centralized mode
    pooled: Option<Dataset>,
    test: Dataset,
    aggregator: ServerAggregator,
    attack: Attack<PatternSynthesizer>,
    rng: ChaCha8Rng,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let d = &config.data;

        let centres = ClassCentres::random(d.classes, d.features, d.noise, &mut rng);
        let participants: Vec<Participant> = (0..config.fl.fl_total_participants)
            .map(|id| Participant {
                id,
                compromised: id < config.fl.fl_number_of_adversaries,
                data: centres.sample(d.samples_per_client, &mut rng),
            })
            .collect();
        let test = centres.sample(d.test_size, &mut rng);
        let global = Mlp::new(d.features, config.train.hidden, d.classes, &mut rng);

        let aggregator = if config.defence.enabled {
            let root = centres.sample(d.root_size, &mut rng);
            let reference = ReferenceSet::sample(
                &root.inputs.into_dyn(),
                config.defence.ref_size,
                config.train.batch_size,
                &mut rng,
            )?;
            ServerAggregator::Cka(FedAvgCka::new(global.clone(), reference, config.defence.clone())?)
        } else {
            ServerAggregator::FedAvg(FedAvgAggregator)
        };

        let pooled = if config.centralized {
            let parts: Vec<&Dataset> = participants.iter().map(|p| &p.data).collect();
            Some(Dataset::concat(&parts)?)
        } else {
            None
        };
        if config.centralized && config.defence.enabled {
            warn!("Defence is enabled but centralized training never aggregates");
        }

        let attack = Attack::new(
            config.balance.clone(),
            PatternSynthesizer::new(&config.backdoor),
            config.train.clip_batch,
            config.fl.fl_weight_scale,
        )?;

        info!(
            participants = participants.len(),
            adversaries = config.fl.fl_number_of_adversaries,
            aggregator = aggregator.as_aggregator().name(),
            centralized = config.centralized,
            seed = config.seed,
            "Simulation ready"
        );

        Ok(Self {
            config,
            global,
            participants,
            pooled,
            test,
            aggregator,
            attack,
            rng,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn global(&self) -> &Mlp {
        &self.global
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn aggregator(&self) -> &ServerAggregator {
        &self.aggregator
    }

    /// Label written into every report of this run.
    fn mode_name(&self) -> &'static str {
        if self.config.centralized {
            CENTRALIZED
        } else {
            self.aggregator.as_aggregator().name()
        }
    }

    /// Clean and backdoor accuracy of the current global model.
    fn evaluate(&self) -> Result<(f64, f64)> {
        let batch_size = self.config.train.batch_size;
        let clean = accuracy(&self.global, &self.test, batch_size)?;
        let backdoor = backdoor_accuracy(&self.global, &self.test, self.attack.synthesizer(), batch_size)?;
        Ok((clean, backdoor))
    }

    /// Evaluate the global model before any training, reported as epoch 0.
    pub fn evaluate_baseline(&self) -> Result<RoundReport> {
        let (clean_accuracy, backdoor_accuracy) = self.evaluate()?;
        info!(clean_accuracy, backdoor_accuracy, "Baseline evaluation");
        Ok(RoundReport {
            epoch: 0,
            aggregator: self.mode_name().to_string(),
            participants: Vec::new(),
            compromised: Vec::new(),
            kept: Vec::new(),
            rejected: Vec::new(),
            clean_accuracy,
            backdoor_accuracy,
            normal_loss_mean: None,
        })
    }

    /// One pass of the global model over the pooled participant data.
    pub fn run_centralized_epoch(&mut self, epoch: usize) -> Result<RoundReport> {
        let Some(pooled) = &self.pooled else {
            return Err(SimError::Config(
                "centralized epochs need `centralized = true`".to_string(),
            ));
        };
        train_epoch(
            &mut self.attack,
            &mut self.global,
            pooled,
            &self.config.train,
            epoch,
            true,
            &mut self.rng,
        )?;
        if !self.global.state().is_finite() {
            warn!(epoch, "Global model has non-finite parameters");
        }

        let (clean_accuracy, backdoor_accuracy) = self.evaluate()?;
        info!(epoch, clean_accuracy, backdoor_accuracy, "Centralized epoch finished");
        Ok(RoundReport {
            epoch,
            aggregator: CENTRALIZED.to_string(),
            participants: Vec::new(),
            compromised: Vec::new(),
            kept: Vec::new(),
            rejected: Vec::new(),
            clean_accuracy,
            backdoor_accuracy,
            normal_loss_mean: self.attack.history().mean(),
        })
    }

    /// Ids of this round's participants, ascending.
    pub fn sample_participants(&mut self) -> Vec<usize> {
        let mut ids = index::sample(
            &mut self.rng,
            self.config.fl.fl_total_participants,
            self.config.fl.fl_no_models,
        )
        .into_vec();
        ids.sort_unstable();
        ids
    }

    /// Train every sampled participant and return what each one submits.
    fn collect_submissions(&mut self, ids: &[usize], global_state: &ClientUpdate) -> Result<Vec<ClientUpdate>> {
        let mut submissions = Vec::with_capacity(ids.len());
        for &id in ids {
            let user = &self.participants[id];
            let mut local = self.global.clone();
            for local_epoch in 0..self.config.fl.fl_local_epochs {
                train_epoch(
                    &mut self.attack,
                    &mut local,
                    &user.data,
                    &self.config.train,
                    local_epoch,
                    user.compromised,
                    &mut self.rng,
                )?;
            }

            let mut delta = local.state().delta_from(global_state)?;
            if user.compromised {
                self.attack.fl_scale_update(&mut delta);
            }
            debug!(client = id, compromised = user.compromised, norm = delta.l2_norm(), "Local update");

            let mut submitted = global_state.clone();
            submitted.add_scaled(&delta, 1.0)?;
            submissions.push(submitted);
        }
        Ok(submissions)
    }

    /// Move the global model by `fl_eta` towards the aggregate.
    fn update_global(&mut self, global_state: &ClientUpdate, result: &AggregationResult) -> Result<()> {
        let step = result.aggregated.delta_from(global_state)?;
        let mut next = global_state.clone();
        next.add_scaled(&step, self.config.fl.fl_eta)?;
        if !next.is_finite() {
            warn!("Aggregated global model has non-finite parameters");
        }
        self.global.load_state(&next)?;
        Ok(())
    }

    fn export_similarity(
        &self,
        dir: &Path,
        epoch: usize,
        ids: &[usize],
        submissions: &[ClientUpdate],
        result: &AggregationResult,
    ) -> Result<()> {
        if let Some(sim) = &result.similarity {
            write_similarity_csv(dir.join(format!("round_{epoch:03}_similarity.csv")), sim, ids)?;
        }
        if !self.config.report.layerwise {
            return Ok(());
        }
        if let Some(cka) = self.aggregator.cka() {
            for (layer, sim) in cka.layerwise_similarity(submissions)? {
                let (vmin, vmax) = heatmap_range(&sim);
                debug!(epoch, layer = %layer, vmin, vmax, "Layer-wise similarity range");
                write_similarity_csv(dir.join(format!("round_{epoch:03}_{layer}.csv")), &sim, ids)?;
            }
        }
        Ok(())
    }

    /// One full federated round followed by evaluation.
    pub fn run_round(&mut self, epoch: usize) -> Result<RoundReport> {
        let ids = self.sample_participants();
        let global_state = self.global.state();

        let submissions = self.collect_submissions(&ids, &global_state)?;
        let result = self.aggregator.as_aggregator().aggregate(&submissions)?;
        self.update_global(&global_state, &result)?;

        if let Some(dir) = self.config.report.output_dir.clone() {
            self.export_similarity(&dir, epoch, &ids, &submissions, &result)?;
        }

        let (clean_accuracy, backdoor_accuracy) = self.evaluate()?;

        let report = RoundReport {
            epoch,
            aggregator: self.aggregator.as_aggregator().name().to_string(),
            compromised: ids
                .iter()
                .copied()
                .filter(|&id| self.participants[id].compromised)
                .collect(),
            kept: result.selected_indices.iter().map(|&i| ids[i]).collect(),
            rejected: result.rejected_indices.iter().map(|&i| ids[i]).collect(),
            participants: ids,
            clean_accuracy,
            backdoor_accuracy,
            normal_loss_mean: self.attack.history().mean(),
        };
        info!(
            epoch,
            clean_accuracy,
            backdoor_accuracy,
            kept = report.kept.len(),
            rejected = ?report.rejected,
            compromised_kept = report.compromised_kept(),
            "Round finished"
        );
        Ok(report)
    }

    /// Baseline evaluation followed by every configured round or epoch,
    /// writing reports when an output directory is set.
    pub fn run(&mut self) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::with_capacity(self.config.epochs + 1);
        reports.push(self.evaluate_baseline()?);
        for epoch in 1..=self.config.epochs {
            let report = if self.config.centralized {
                self.run_centralized_epoch(epoch)?
            } else {
                self.run_round(epoch)?
            };
            reports.push(report);
        }
        if let Some(dir) = &self.config.report.output_dir {
            write_round_reports(dir.join("rounds.csv"), &reports)?;
            write_summary_json(dir.join("summary.json"), &reports)?;
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SimConfig {
        let mut config = SimConfig::default();
        config.epochs = 2;
        config.data.samples_per_client = 32;
        config.data.test_size = 64;
        config.fl.fl_total_participants = 6;
        config.fl.fl_no_models = 4;
        config
    }

    #[test]
    fn test_compromised_are_the_first_ids() {
        let mut config = small_config();
        config.fl.fl_number_of_adversaries = 2;
        let sim = Simulation::new(config).unwrap();
        let flags: Vec<bool> = sim.participants().iter().map(|p| p.compromised).collect();
        assert_eq!(flags, vec![true, true, false, false, false, false]);
    }

    #[test]
    fn test_sampling_is_seeded_and_distinct() {
        let mut a = Simulation::new(small_config()).unwrap();
        let mut b = Simulation::new(small_config()).unwrap();
        let ids = a.sample_participants();
        assert_eq!(ids, b.sample_participants());
        let mut dedup = ids.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);
    }

    #[test]
    fn test_fedavg_round_keeps_everyone() {
        let mut sim = Simulation::new(small_config()).unwrap();
        let before = sim.global().state();
        let report = sim.run_round(1).unwrap();
        assert_eq!(report.aggregator, "FedAvg");
        assert_eq!(report.kept, report.participants);
        assert!(report.rejected.is_empty());
        assert_ne!(sim.global().state(), before);
    }

    #[test]
    fn test_baseline_leaves_model_untouched() {
        let sim = Simulation::new(small_config()).unwrap();
        let before = sim.global().state();
        let report = sim.evaluate_baseline().unwrap();
        assert_eq!(report.epoch, 0);
        assert_eq!(report.aggregator, "FedAvg");
        assert!(report.participants.is_empty() && report.kept.is_empty());
        assert_eq!(report.normal_loss_mean, None);
        assert!((0.0..=1.0).contains(&report.clean_accuracy));
        assert_eq!(sim.global().state(), before);
    }

    #[test]
    fn test_centralized_epoch_trains_global_on_pooled_data() {
        let mut config = small_config();
        config.centralized = true;
        let mut sim = Simulation::new(config).unwrap();
        assert_eq!(sim.pooled.as_ref().map(Dataset::len), Some(6 * 32));

        let before = sim.global().state();
        let report = sim.run_centralized_epoch(1).unwrap();
        assert_eq!(report.aggregator, CENTRALIZED);
        assert!(report.participants.is_empty());
        assert!(report.normal_loss_mean.is_some());
        assert_ne!(sim.global().state(), before);
    }

    #[test]
    fn test_centralized_epoch_needs_centralized_mode() {
        let mut sim = Simulation::new(small_config()).unwrap();
        assert!(matches!(sim.run_centralized_epoch(1), Err(SimError::Config(_))));
    }

    #[test]
    fn test_zero_eta_freezes_global_model() {
        let mut config = small_config();
        config.fl.fl_eta = 0.0;
        let mut sim = Simulation::new(config).unwrap();
        let before = sim.global().state();
        sim.run_round(1).unwrap();
        assert_eq!(sim.global().state(), before);
    }
}
