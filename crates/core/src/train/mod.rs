//! Fine-tuning driver for LoRA image classifiers.
//!
//! A [`Trainer`] runs AdamW with gradient accumulation and a linear learning
//! rate decay over the trainable variables of a
//! [`LoraImageClassifier`](crate::model::LoraImageClassifier), evaluating on the
//! held-out split after every epoch.

mod args;
mod metrics;
mod trainer;

use thiserror::Error;

use crate::preprocess::PreprocessError;

pub use args::{LinearSchedule, TrainingArgs};
pub use metrics::{evaluate, EpochMetrics, EvalReport, TrainOutcome, TrainingReport};
pub use trainer::Trainer;

/// Errors from training and evaluation.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid training arguments: {0}")]
    InvalidArgs(String),
    #[error("{0} split is empty")]
    EmptySplit(&'static str),
    #[error("model has {model} labels but the dataset has {dataset}")]
    LabelCount { model: usize, dataset: usize },
    #[error("loss is not finite at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize },
    #[error("preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("failed to (de)serialize report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
