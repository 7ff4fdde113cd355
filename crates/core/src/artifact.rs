//! On-disk adapter artifacts.
//!
//! One directory per task, readable by PEFT:
//!
//! ```text
//! model1/
//!   adapter_config.json          LoraConfig
//!   adapter_model.safetensors    LoRA A/B matrices and the classifier head
//!   labels.json                  id2label / label2id
//!   training_report.json         per-epoch metrics and the final evaluation
//! ```
//!
//! Backbone weights are never written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use crate::labels::{LabelError, LabelMap};
use crate::lora::{peft_tensor_name, LoraConfig, LoraLoadError, LoraLoader, LoraModel};
use crate::model::{ClassifierHead, LoraImageClassifier, ModelError};
use crate::train::{TrainError, TrainingReport};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const LABELS_FILE: &str = "labels.json";
pub const REPORT_FILE: &str = "training_report.json";

/// Module name of the classifier head inside the adapted model.
pub const HEAD_MODULE: &str = "classifier";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write adapter config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("labels: {0}")]
    Labels(#[from] LabelError),
    #[error("adapter: {0}")]
    Lora(#[from] LoraLoadError),
    #[error("classifier head: {0}")]
    Model(#[from] ModelError),
    #[error("training report: {0}")]
    Report(#[from] TrainError),
    #[error("artifact {0} has no classifier head")]
    MissingHead(String),
    #[error("classifier head has {head} outputs but labels.json lists {labels} labels")]
    HeadLabelMismatch { head: usize, labels: usize },
}

/// A loaded artifact directory.
#[derive(Debug)]
pub struct AdapterArtifact {
    pub dir: PathBuf,
    pub config: LoraConfig,
    pub lora: LoraModel,
    pub head: ClassifierHead,
    pub labels: LabelMap,
    /// Absent for artifacts written by other tools.
    pub report: Option<TrainingReport>,
}

/// Write `model`'s adapter, head, labels and `report` into `dir`.
pub fn save(
    model: &LoraImageClassifier,
    dir: impl AsRef<Path>,
    report: &TrainingReport,
) -> Result<PathBuf, ArtifactError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut config = model.lora_config().clone();
    config.inference_mode = true;
    if !config.is_saved_module(HEAD_MODULE) {
        config.modules_to_save.push(HEAD_MODULE.to_string());
    }
    std::fs::write(
        dir.join(ADAPTER_CONFIG_FILE),
        serde_json::to_string_pretty(&config)?,
    )?;

    let tensors: HashMap<String, Tensor> = model
        .trainable_tensors()?
        .into_iter()
        .map(|(name, tensor)| (peft_tensor_name(&name), tensor))
        .collect();
    candle_core::safetensors::save(&tensors, dir.join(ADAPTER_WEIGHTS_FILE))?;

    model.labels().save(dir.join(LABELS_FILE))?;
    report.save(dir.join(REPORT_FILE))?;

    let bytes = dir_size_bytes(dir)?;
    tracing::info!(
        adapter = model.adapter_name(),
        dir = %dir.display(),
        tensors = tensors.len(),
        bytes,
        "saved adapter artifact"
    );
    Ok(dir.to_path_buf())
}

/// Load an artifact directory; the adapter is named after the directory.
pub fn load(dir: impl AsRef<Path>, device: &Device, dtype: DType) -> Result<AdapterArtifact, ArtifactError> {
    let dir = dir.as_ref();
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "adapter".to_string());

    let config = LoraLoader::load_config(dir)?;
    let lora = LoraLoader::new(device.clone(), dtype).load(dir, name, 0)?;
    let labels = load_labels(dir)?;
    let head = head_from_lora(&lora, &labels)?;

    let report_path = dir.join(REPORT_FILE);
    let report = if report_path.exists() {
        Some(TrainingReport::load(report_path)?)
    } else {
        None
    };

    Ok(AdapterArtifact {
        dir: dir.to_path_buf(),
        config,
        lora,
        head,
        labels,
        report,
    })
}

/// Read `labels.json` from an artifact directory.
pub fn load_labels(dir: impl AsRef<Path>) -> Result<LabelMap, ArtifactError> {
    Ok(LabelMap::load(dir.as_ref().join(LABELS_FILE))?)
}

/// Classifier head stored with `lora`, checked against `labels`.
pub fn head_from_lora(lora: &LoraModel, labels: &LabelMap) -> Result<ClassifierHead, ArtifactError> {
    let weight = lora.saved_tensor(&format!("{HEAD_MODULE}.weight"));
    let bias = lora.saved_tensor(&format!("{HEAD_MODULE}.bias"));
    let (Some(weight), Some(bias)) = (weight, bias) else {
        return Err(ArtifactError::MissingHead(lora.name.clone()));
    };

    let head = ClassifierHead::from_tensors(weight.clone(), bias.clone())?;
    if head.num_labels() != labels.len() {
        return Err(ArtifactError::HeadLabelMismatch {
            head: head.num_labels(),
            labels: labels.len(),
        });
    }
    Ok(head)
}

/// Total size of the regular files under `dir`, recursively.
pub fn dir_size_bytes(dir: impl AsRef<Path>) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size_bytes(entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}
