//! Per-round results and CSV/JSON export.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of one federated round. Client ids refer to participants, not
/// to positions within the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub epoch: usize,
    pub aggregator: String,
    pub participants: Vec<usize>,
    pub compromised: Vec<usize>,
    pub kept: Vec<usize>,
    pub rejected: Vec<usize>,
    pub clean_accuracy: f64,
    pub backdoor_accuracy: f64,
    /// Mean "normal" loss over the attacker's recent window, if any was recorded
    pub normal_loss_mean: Option<f64>,
}

impl RoundReport {
    /// Whether any compromised client made it into the aggregate.
    pub fn compromised_kept(&self) -> bool {
        self.compromised.iter().any(|id| self.kept.contains(id))
    }

    /// Share of compromised clients that were filtered out.
    pub fn detection_rate(&self) -> Option<f64> {
        if self.compromised.is_empty() {
            return None;
        }
        let caught = self
            .compromised
            .iter()
            .filter(|id| self.rejected.contains(id))
            .count();
        Some(caught as f64 / self.compromised.len() as f64)
    }
}

/// Flat CSV row; id lists are space separated.
#[derive(Debug, Serialize)]
struct RoundRow<'a> {
    epoch: usize,
    aggregator: &'a str,
    participants: String,
    compromised: String,
    kept: String,
    rejected: String,
    compromised_kept: bool,
    clean_accuracy: f64,
    backdoor_accuracy: f64,
    normal_loss_mean: Option<f64>,
}

fn join(ids: &[usize]) -> String {
    ids.iter().map(usize::to_string).collect::<Vec<_>>().join(" ")
}

impl<'a> From<&'a RoundReport> for RoundRow<'a> {
    fn from(r: &'a RoundReport) -> Self {
        Self {
            epoch: r.epoch,
            aggregator: &r.aggregator,
            participants: join(&r.participants),
            compromised: join(&r.compromised),
            kept: join(&r.kept),
            rejected: join(&r.rejected),
            compromised_kept: r.compromised_kept(),
            clean_accuracy: r.clean_accuracy,
            backdoor_accuracy: r.backdoor_accuracy,
            normal_loss_mean: r.normal_loss_mean,
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn write_round_reports(path: impl AsRef<Path>, reports: &[RoundReport]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for report in reports {
        writer.serialize(RoundRow::from(report))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summary_json(path: impl AsRef<Path>, reports: &[RoundReport]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, reports)?;
    Ok(())
}

/// Square similarity matrix with client ids as row and column headers.
pub fn write_similarity_csv(path: impl AsRef<Path>, sim: &Array2<f64>, ids: &[usize]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["client".to_string()];
    header.extend(ids.iter().map(usize::to_string));
    writer.write_record(&header)?;

    for (id, row) in ids.iter().zip(sim.rows()) {
        let mut record = vec![id.to_string()];
        record.extend(row.iter().map(|v| format!("{v:.6}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
