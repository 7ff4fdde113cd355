use serde::{Deserialize, Serialize};

use super::TrainError;
use crate::model::Precision;

/// Hyperparameters of one fine-tuning run. Epoch count comes from the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    /// Micro-batch size for training and evaluation.
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Backbone dtype; the adapter path and head always train in f32.
    pub precision: Precision,
    /// Log the running loss every this many optimizer steps.
    pub logging_steps: usize,
    pub eval_every_epoch: bool,
    /// Restore the epoch with the best held-out accuracy when training ends.
    pub load_best_model_at_end: bool,
    /// Seeds the per-epoch shuffle.
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            batch_size: 128,
            gradient_accumulation_steps: 4,
            learning_rate: 5e-3,
            weight_decay: 0.0,
            precision: Precision::Auto,
            logging_steps: 10,
            eval_every_epoch: true,
            load_best_model_at_end: true,
            seed: 42,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::InvalidArgs("batch_size must be > 0".into()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainError::InvalidArgs(
                "gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidArgs(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay.is_nan() || self.weight_decay < 0.0 {
            return Err(TrainError::InvalidArgs(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }

    /// Batch size seen by one optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size * self.gradient_accumulation_steps
    }

    /// Optimizer steps per epoch over `num_samples` training records.
    pub fn steps_per_epoch(&self, num_samples: usize) -> usize {
        let micro_batches = num_samples.div_ceil(self.batch_size.max(1));
        micro_batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }
}

/// Linear decay from the initial rate to zero over `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    initial_lr: f64,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(initial_lr: f64, total_steps: usize) -> Self {
        Self {
            initial_lr,
            total_steps,
        }
    }

    /// Rate applied at optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.initial_lr;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        self.initial_lr * remaining / self.total_steps as f64
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}
