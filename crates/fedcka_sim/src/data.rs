//! Synthetic classification data and batches.
//!
//! Each class has a fixed centre drawn once per experiment; samples are the
//! centre plus uniform noise. Clients, the server root set and the test set
//! all draw from the same centres.

use ndarray::{concatenate, s, Array2, Axis};
use rand::Rng;

use crate::error::{Result, SimError};

/// Inputs and labels of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(SimError::BatchMismatch {
                inputs: inputs.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Clamp every input into `bounds`; `None` leaves the batch untouched.
    pub fn clip(&self, bounds: Option<(f32, f32)>) -> Batch {
        match bounds {
            Some((lo, hi)) => Batch {
                inputs: self.inputs.mapv(|v| v.clamp(lo, hi)),
                labels: self.labels.clone(),
            },
            None => self.clone(),
        }
    }
}

/// Class centres shared by every split of one experiment.
#[derive(Debug, Clone)]
pub struct ClassCentres {
    centres: Array2<f32>,
    noise: f32,
}

impl ClassCentres {
    pub fn random<R: Rng + ?Sized>(classes: usize, features: usize, noise: f32, rng: &mut R) -> Self {
        let centres = Array2::from_shape_fn((classes, features), |_| rng.gen_range(-1.0f32..1.0));
        Self { centres, noise }
    }

    pub fn classes(&self) -> usize {
        self.centres.nrows()
    }

    pub fn features(&self) -> usize {
        self.centres.ncols()
    }

    /// `n` samples with uniformly drawn labels.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Dataset {
        let labels: Vec<usize> = (0..n).map(|_| rng.gen_range(0..self.classes())).collect();
        let mut inputs = Array2::<f32>::zeros((n, self.features()));
        for (mut row, &label) in inputs.outer_iter_mut().zip(&labels) {
            for (v, &c) in row.iter_mut().zip(self.centres.row(label)) {
                *v = c + self.noise * rng.gen_range(-1.0f32..1.0);
            }
        }
        Dataset { inputs, labels }
    }
}

/// In-memory labelled samples.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Consecutive batches of at most `batch_size` rows.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let batch_size = batch_size.max(1);
        (0..self.len()).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(self.len());
            Batch {
                inputs: self.inputs.slice(s![start..end, ..]).to_owned(),
                labels: self.labels[start..end].to_vec(),
            }
        })
    }

    /// Rows of every part, in order. Fails on an empty slice or on parts
    /// with different feature counts.
    pub fn concat(parts: &[&Dataset]) -> Result<Dataset> {
        let views: Vec<_> = parts.iter().map(|d| d.inputs.view()).collect();
        let inputs = concatenate(Axis(0), &views)?;
        let labels = parts.iter().flat_map(|d| d.labels.iter().copied()).collect();
        Ok(Dataset { inputs, labels })
    }

    /// Same samples in a random order.
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Dataset {
        let order = rand::seq::index::sample(rng, self.len(), self.len()).into_vec();
        Dataset {
            inputs: self.inputs.select(Axis(0), &order),
            labels: order.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_batches_cover_dataset() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let data = ClassCentres::random(3, 5, 0.1, &mut rng).sample(10, &mut rng);
        let sizes: Vec<usize> = data.batches(4).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(data.labels.iter().all(|&l| l < 3));
    }

    #[test]
    fn test_clip_bounds_inputs() {
        let batch = Batch::new(arr2(&[[-5.0f32, 0.5], [2.0, 9.0]]), vec![0, 1]).unwrap();
        let clipped = batch.clip(Some((-1.0, 1.0)));
        assert_eq!(clipped.inputs, arr2(&[[-1.0f32, 0.5], [1.0, 1.0]]));
        assert_eq!(batch.clip(None), batch);
    }

    #[test]
    fn test_batch_shape_checked() {
        assert!(Batch::new(Array2::zeros((2, 3)), vec![0]).is_err());
    }

    #[test]
    fn test_concat_pools_rows_in_order() {
        let a = Dataset {
            inputs: arr2(&[[0.0f32, 0.0], [1.0, 1.0]]),
            labels: vec![0, 1],
        };
        let b = Dataset {
            inputs: arr2(&[[2.0f32, 2.0]]),
            labels: vec![2],
        };
        let pooled = Dataset::concat(&[&a, &b]).unwrap();
        assert_eq!(pooled.labels, vec![0, 1, 2]);
        assert_eq!(pooled.inputs.row(2)[0], 2.0);

        let narrow = Dataset {
            inputs: arr2(&[[0.0f32]]),
            labels: vec![0],
        };
        assert!(matches!(Dataset::concat(&[&a, &narrow]), Err(SimError::Shape(_))));
        assert!(Dataset::concat(&[]).is_err());
    }

    #[test]
    fn test_shuffle_keeps_pairs() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let data = Dataset {
            inputs: arr2(&[[0.0f32], [1.0], [2.0], [3.0]]),
            labels: vec![0, 1, 2, 3],
        };
        let shuffled = data.shuffled(&mut rng);
        for (row, &label) in shuffled.inputs.outer_iter().zip(&shuffled.labels) {
            assert_eq!(row[0] as usize, label);
        }
    }
}
