use std::collections::VecDeque;

/// Default number of recent main-task losses kept for threshold gating
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Bounded window of recent "normal"-task losses.
///
/// Owned by the training driver and handed to the balancer by reference.
/// Once full, each push evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct LossHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Default for LossHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl LossHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, loss: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(loss);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Mean of the window, `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
