use crate::data::Dataset;
use crate::error::Result;
use crate::model::Mlp;
use crate::synthesizer::Synthesizer;

/// Top-1 accuracy on clean data.
pub fn accuracy(model: &Mlp, data: &Dataset, batch_size: usize) -> Result<f64> {
    let mut correct = 0usize;
    let mut total = 0usize;
    for batch in data.batches(batch_size) {
        let predicted = model.predict(&batch.inputs)?;
        correct += predicted
            .iter()
            .zip(&batch.labels)
            .filter(|(p, l)| p == l)
            .count();
        total += batch.len();
    }
    Ok(if total == 0 { 0.0 } else { correct as f64 / total as f64 })
}

/// Share of fully triggered test inputs classified as the backdoor label.
pub fn backdoor_accuracy<S: Synthesizer>(
    model: &Mlp,
    data: &Dataset,
    synthesizer: &S,
    batch_size: usize,
) -> Result<f64> {
    let mut hits = 0usize;
    let mut total = 0usize;
    for batch in data.batches(batch_size) {
        let poisoned = synthesizer.make_backdoor_batch(&batch, true, true);
        let predicted = model.predict(&poisoned.inputs)?;
        hits += predicted
            .iter()
            .zip(&poisoned.labels)
            .filter(|(p, l)| p == l)
            .count();
        total += poisoned.len();
    }
    Ok(if total == 0 { 0.0 } else { hits as f64 / total as f64 })
}
