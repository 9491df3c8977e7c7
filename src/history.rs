//! Per-phase metric aggregation, best-epoch tracking and the epoch history.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Running sums over the batches of one phase.
#[derive(Debug, Default, Clone)]
pub struct PhaseMeter {
    loss_sum: f64,
    correct: i64,
    seen: i64,
}

impl PhaseMeter {
    /// `loss` is the batch mean; it is weighted by `batch_size`.
    pub fn update(&mut self, loss: f64, correct: i64, batch_size: i64) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    pub fn finish(&self) -> PhaseMetrics {
        if self.seen == 0 {
            return PhaseMetrics::default();
        }
        let n = self.seen as f64;
        PhaseMetrics {
            loss: self.loss_sum / n,
            accuracy: self.correct as f64 / n * 100.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    pub loss: f64,
    /// Percentage in `[0, 100]`.
    pub accuracy: f64,
}

/// Keeps the first strictly-best accuracy together with a payload captured
/// only when a new best is observed.
#[derive(Debug)]
pub struct BestTracker<T> {
    accuracy: f64,
    epoch: Option<usize>,
    payload: T,
}

impl<T> BestTracker<T> {
    /// `initial` is kept as payload until an epoch beats `0.0`.
    pub fn new(initial: T) -> BestTracker<T> {
        BestTracker {
            accuracy: 0.0,
            epoch: None,
            payload: initial,
        }
    }

    /// Returns true when `accuracy` became the new best.
    pub fn observe<F>(&mut self, epoch: usize, accuracy: f64, capture: F) -> bool
    where
        F: FnOnce() -> T,
    {
        if accuracy > self.accuracy {
            self.accuracy = accuracy;
            self.epoch = Some(epoch);
            self.payload = capture();
            true
        } else {
            false
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

/// One row of the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
}

#[derive(Debug, Default, Clone)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
    pub learning_rate: Vec<f64>,
}

impl History {
    pub fn push(&mut self, learning_rate: f64, train: PhaseMetrics, val: PhaseMetrics) {
        self.learning_rate.push(learning_rate);
        self.train_loss.push(train.loss);
        self.train_acc.push(train.accuracy);
        self.val_loss.push(val.loss);
        self.val_acc.push(val.accuracy);
    }

    pub fn len(&self) -> usize {
        self.val_acc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.val_acc.is_empty()
    }

    pub fn records(&self) -> Vec<EpochRecord> {
        (0..self.len())
            .map(|epoch| EpochRecord {
                epoch,
                learning_rate: self.learning_rate[epoch],
                train_loss: self.train_loss[epoch],
                train_acc: self.train_acc[epoch],
                val_loss: self.val_loss[epoch],
                val_acc: self.val_acc[epoch],
            })
            .collect()
    }

    pub fn write_csv<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for record in self.records() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
