use std::path::Path;

use candle_core::{DType, D};
use candle_nn::loss;
use serde::{Deserialize, Serialize};

use super::TrainError;
use crate::dataset::ImageDataset;
use crate::model::{LoraImageClassifier, ParameterCount};
use crate::preprocess::{ImageProcessor, TransformedSplit};

/// Accuracy and mean cross-entropy over a split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    /// Fraction of correctly classified samples, in `[0, 1]`.
    pub accuracy: f64,
    pub loss: f64,
    pub samples: usize,
}

/// Metrics recorded at the end of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub learning_rate: f64,
    pub global_step: usize,
    pub eval: Option<EvalReport>,
    pub elapsed_secs: f64,
}

/// What [`super::Trainer::train`] produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub epochs: Vec<EpochMetrics>,
    /// Epoch whose weights the model holds after training, when tracked.
    pub best_epoch: Option<usize>,
    pub global_steps: usize,
    /// Evaluation of the final (possibly restored) weights on the held-out split.
    pub final_eval: EvalReport,
    pub runtime_secs: f64,
}

/// `training_report.json` of an adapter artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub task: String,
    pub parameters: ParameterCount,
    pub train_samples: usize,
    pub eval_samples: usize,
    #[serde(flatten)]
    pub outcome: TrainOutcome,
}

impl TrainingReport {
    pub fn new(
        task: impl Into<String>,
        parameters: ParameterCount,
        train_samples: usize,
        outcome: TrainOutcome,
    ) -> Self {
        Self {
            task: task.into(),
            parameters,
            train_samples,
            eval_samples: outcome.final_eval.samples,
            outcome,
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.outcome.final_eval.accuracy
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TrainError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Evaluate `model` on `split` in eval mode (no dropout).
pub fn evaluate(
    model: &LoraImageClassifier,
    split: &ImageDataset,
    processor: &ImageProcessor,
    batch_size: usize,
) -> Result<EvalReport, TrainError> {
    if split.is_empty() {
        return Err(TrainError::EmptySplit("eval"));
    }

    let transformed = TransformedSplit::new(split, processor);
    let order = transformed.sequential_order();
    let mut correct = 0usize;
    let mut loss_sum = 0f64;
    let mut samples = 0usize;

    for batch in transformed.batches(&order, batch_size) {
        let batch = batch?;
        let n = batch.len();
        let logits = model.forward(&batch.pixel_values, false)?;
        let batch_loss = loss::cross_entropy(&logits, &batch.labels)?.to_scalar::<f32>()?;
        let predicted = logits.argmax(D::Minus1)?;
        let hits = predicted
            .eq(&batch.labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;

        correct += hits as usize;
        loss_sum += batch_loss as f64 * n as f64;
        samples += n;
    }

    Ok(EvalReport {
        accuracy: correct as f64 / samples as f64,
        loss: loss_sum / samples as f64,
        samples,
    })
}
