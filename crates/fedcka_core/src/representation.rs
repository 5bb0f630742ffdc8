//! Model abstraction and activation extraction on a shared reference set.
//!
//! A forward pass receives an [`ActivationCapture`] that lives for exactly
//! one extraction. Nothing is registered on the model itself, so there is
//! nothing to detach when a pass fails half way.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{concatenate, Array2, Axis};
use rand::seq::index;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{FedCkaError, Result};
use crate::tensor::{ClientUpdate, Tensor};

/// What the defence and the training driver need from a network.
pub trait Model: Clone {
    /// Export every parameter by name.
    fn state(&self) -> ClientUpdate;

    /// Replace every parameter.
    ///
    /// Strict: names must match exactly and each tensor must keep its shape.
    fn load_state(&mut self, state: &ClientUpdate) -> Result<()>;

    /// Names of the layers whose outputs can be captured, in forward order.
    fn layer_names(&self) -> Vec<String>;

    /// Switch between training and inference behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Freeze or unfreeze parameter updates.
    fn switch_grads(&mut self, _enabled: bool) {}

    /// Run one batch (batch dimension first), handing every layer output to
    /// `capture`.
    fn forward(&self, inputs: &Tensor, capture: &mut ActivationCapture) -> Result<Tensor>;
}

/// Collects flattened layer outputs for the layers it was opened for.
#[derive(Debug, Default)]
pub struct ActivationCapture {
    buffers: BTreeMap<String, Vec<Array2<f32>>>,
}

impl ActivationCapture {
    pub fn new<S: AsRef<str>>(layers: &[S]) -> Self {
        Self {
            buffers: layers
                .iter()
                .map(|l| (l.as_ref().to_string(), Vec::new()))
                .collect(),
        }
    }

    /// A capture that records nothing, for plain inference and training.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn wants(&self, layer: &str) -> bool {
        self.buffers.contains_key(layer)
    }

    /// Record `output` for `layer` if it was requested, flattened to
    /// `(batch, features)`.
    pub fn record(&mut self, layer: &str, output: &Tensor) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(layer) else {
            return Ok(());
        };
        buffer.push(flatten_batch(layer, output)?);
        Ok(())
    }

    /// Stack every recorded batch per layer.
    pub fn finish(self) -> Result<BTreeMap<String, Array2<f32>>> {
        self.buffers
            .into_iter()
            .map(|(layer, batches)| {
                if batches.is_empty() {
                    return Err(FedCkaError::EmptyCapture(layer));
                }
                let cols = batches[0].ncols();
                if let Some(bad) = batches.iter().find(|b| b.ncols() != cols) {
                    return Err(FedCkaError::ShapeMismatch {
                        name: layer,
                        expected: vec![bad.nrows(), cols],
                        actual: bad.shape().to_vec(),
                    });
                }
                let views: Vec<_> = batches.iter().map(|b| b.view()).collect();
                let stacked = concatenate(Axis(0), &views)
                    .map_err(|_| FedCkaError::EmptyCapture(layer.clone()))?;
                Ok((layer, stacked))
            })
            .collect()
    }
}

fn flatten_batch(layer: &str, output: &Tensor) -> Result<Array2<f32>> {
    let shape = output.shape();
    let rows = shape.first().copied().unwrap_or(1);
    let cols: usize = shape.iter().skip(1).product();
    output
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))
        .map_err(|_| FedCkaError::ShapeMismatch {
            name: layer.to_string(),
            expected: vec![rows, cols],
            actual: shape.to_vec(),
        })
}

/// Fixed inputs every candidate update is probed with.
///
/// Sampled once and reused for every client in every round so that
/// similarity scores are comparable.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    batches: Vec<Tensor>,
}

impl ReferenceSet {
    pub fn new(batches: Vec<Tensor>) -> Result<Self> {
        if batches.is_empty() || batches.iter().any(|b| b.shape().first() == Some(&0)) {
            return Err(FedCkaError::EmptyReference);
        }
        Ok(Self { batches })
    }

    /// Draw `ref_size` rows without replacement from `inputs` and split
    /// them into batches of `batch_size`.
    pub fn sample<R: Rng + ?Sized>(
        inputs: &Tensor,
        ref_size: usize,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let available = inputs.shape().first().copied().unwrap_or(0);
        let take = ref_size.min(available);
        if take < ref_size {
            warn!(
                requested = ref_size,
                available, "Reference pool smaller than ref_size, using every row"
            );
        }
        if take == 0 {
            return Err(FedCkaError::EmptyReference);
        }
        let rows = index::sample(rng, available, take).into_vec();
        let picked = inputs.select(Axis(0), &rows);

        let batch_size = batch_size.max(1);
        let batches = (0..take)
            .step_by(batch_size)
            .map(|start| {
                let end = (start + batch_size).min(take);
                picked.slice_axis(Axis(0), (start..end).into()).to_owned()
            })
            .collect();
        debug!(rows = take, batch_size, "Sampled reference set");
        Self::new(batches)
    }

    pub fn batches(&self) -> &[Tensor] {
        &self.batches
    }

    /// Total number of reference examples.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.shape()[0]).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-layer activation matrices of one update, `(reference rows, features)`.
pub type Activations = BTreeMap<String, Array2<f32>>;

/// Runs candidate weights over the reference set and returns their
/// activations at the requested layers.
#[derive(Debug, Clone)]
pub struct RepresentationExtractor<M: Model> {
    template: M,
    reference: ReferenceSet,
}

impl<M: Model> RepresentationExtractor<M> {
    pub fn new(template: M, reference: ReferenceSet) -> Self {
        Self {
            template,
            reference,
        }
    }

    pub fn template(&self) -> &M {
        &self.template
    }

    pub fn reference(&self) -> &ReferenceSet {
        &self.reference
    }

    /// Fail on any layer the template cannot capture.
    pub fn check_layers<S: AsRef<str>>(&self, layers: &[S]) -> Result<()> {
        let known: BTreeSet<String> = self.template.layer_names().into_iter().collect();
        for layer in layers {
            if !known.contains(layer.as_ref()) {
                return Err(FedCkaError::UnknownLayer(layer.as_ref().to_string()));
            }
        }
        Ok(())
    }

    /// Load `weights` into a copy of the template and capture `layers`.
    ///
    /// The template is never modified.
    pub fn extract<S: AsRef<str>>(&self, weights: &ClientUpdate, layers: &[S]) -> Result<Activations> {
        self.check_layers(layers)?;

        let mut model = self.template.clone();
        model.load_state(weights)?;
        model.set_training(false);
        model.switch_grads(false);

        let mut capture = ActivationCapture::new(layers);
        for batch in &self.reference.batches {
            model.forward(batch, &mut capture)?;
        }
        capture.finish()
    }
}
