//! # fedcka_sim
//!
//! Synthetic federated-learning runs that pit a blind-loss backdoor attacker
//! against a CKA-filtering server.
//!
//! ```no_run
//! use fedcka_sim::{init_tracing, SimConfig, Simulation};
//!
//! let config = SimConfig::load("crates/fedcka_sim/configs/default.toml")?;
//! init_tracing(&config.log)?;
//! let reports = Simulation::new(config)?.run()?;
//! println!("final backdoor accuracy: {:.3}", reports[reports.len() - 1].backdoor_accuracy);
//! # Ok::<(), fedcka_sim::SimError>(())
//! ```

pub mod attack;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod report;
pub mod round;
pub mod synthesizer;

pub use attack::{Attack, RunningStats};
pub use config::{BackdoorConfig, DataConfig, FlConfig, LogConfig, ReportConfig, SimConfig, TrainConfig};
pub use data::{Batch, ClassCentres, Dataset};
pub use error::{Result, SimError};
pub use logging::init_tracing;
pub use metrics::{accuracy, backdoor_accuracy};
pub use model::Mlp;
pub use report::{write_round_reports, write_similarity_csv, write_summary_json, RoundReport};
pub use round::{Participant, ServerAggregator, Simulation};
pub use synthesizer::{PatternSynthesizer, Synthesizer};
