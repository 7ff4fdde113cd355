//! Per-task configuration and the two built-in tasks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetSpec;

/// Records loaded per preset dataset.
pub const PRESET_MAX_RECORDS: usize = 5000;

/// One classification task: what to train on, for how long, and where the
/// adapter artifact goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Adapter name; also the artifact directory name by default.
    pub name: String,
    pub dataset: DatasetSpec,
    pub epochs: usize,
    pub output_dir: PathBuf,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, dataset: DatasetSpec, epochs: usize) -> Self {
        let name = name.into();
        Self {
            output_dir: PathBuf::from(format!("./{name}")),
            name,
            dataset,
            epochs,
        }
    }

    /// `model1`: 101 food categories, 5 epochs.
    pub fn food101() -> Self {
        Self::new(
            "model1",
            DatasetSpec::hub("ethz/food101").with_max_records(PRESET_MAX_RECORDS),
            5,
        )
    }

    /// `model2`: cats vs dogs, 2 epochs. The dataset names its class column
    /// `labels`; it is read as the canonical `label`.
    pub fn cats_vs_dogs() -> Self {
        Self::new(
            "model2",
            DatasetSpec::hub("microsoft/cats_vs_dogs")
                .with_label_column("labels")
                .with_max_records(PRESET_MAX_RECORDS),
            2,
        )
    }

    /// Both built-in tasks, in training order.
    pub fn presets() -> Vec<Self> {
        vec![Self::food101(), Self::cats_vs_dogs()]
    }

    /// Look up a built-in task by adapter name or dataset alias.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "model1" | "food101" => Some(Self::food101()),
            "model2" | "cats_vs_dogs" => Some(Self::cats_vs_dogs()),
            _ => None,
        }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Put the artifact at `root/<name>`.
    pub fn with_output_root(mut self, root: impl AsRef<Path>) -> Self {
        self.output_dir = root.as_ref().join(&self.name);
        self
    }
}
