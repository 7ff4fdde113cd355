//! Dataset specifications and loading.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::folder::load_image_folder;
use super::shards::{hf_label_names, ParquetShardReader};
use super::{sample_indices, DatasetError, ImageDataset};
use crate::hub;
use crate::labels::LabelMap;

/// Where a dataset comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    /// Parquet shards of a HuggingFace Hub dataset repository.
    Hub {
        repo: String,
        #[serde(default = "default_split")]
        split: String,
        #[serde(default)]
        revision: Option<String>,
    },
    /// Local directory with one sub-directory per class.
    ImageFolder { root: PathBuf },
}

fn default_split() -> String {
    "train".to_string()
}

/// Everything needed to load one task's dataset and split it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub source: DatasetSource,
    /// Column holding the image (hub sources only).
    #[serde(default = "default_image_column")]
    pub image_column: String,
    /// Column holding the class id; loaded as the canonical `label`.
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Class names used when the shards carry no `ClassLabel` metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_names: Vec<String>,
    /// Load at most this many records.
    #[serde(default)]
    pub max_records: Option<usize>,
    /// Fraction of records held out for evaluation.
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    /// Seed of the train/test shuffle.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_image_column() -> String {
    "image".to_string()
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_test_fraction() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

impl DatasetSpec {
    /// Spec with default columns, split and seed.
    pub fn new(source: DatasetSource) -> Self {
        Self {
            source,
            image_column: default_image_column(),
            label_column: default_label_column(),
            label_names: Vec::new(),
            max_records: None,
            test_fraction: default_test_fraction(),
            seed: default_seed(),
        }
    }

    /// Spec for a hub dataset's `train` split.
    pub fn hub(repo: impl Into<String>) -> Self {
        Self::new(DatasetSource::Hub {
            repo: repo.into(),
            split: default_split(),
            revision: None,
        })
    }

    /// Spec for a local image folder.
    pub fn image_folder(root: impl Into<PathBuf>) -> Self {
        Self::new(DatasetSource::ImageFolder { root: root.into() })
    }

    pub fn with_label_column(mut self, column: impl Into<String>) -> Self {
        self.label_column = column.into();
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    /// Load the dataset described by this spec.
    ///
    /// `max_records` keeps a uniform random subset drawn with `seed` rather
    /// than the first rows, which are often all of one class.
    pub fn load(&self) -> Result<ImageDataset, DatasetError> {
        let dataset = match &self.source {
            DatasetSource::ImageFolder { root } => {
                let dataset = load_image_folder(root)?;
                match self.max_records {
                    Some(n) => dataset.sample(n, self.seed),
                    None => dataset,
                }
            }
            DatasetSource::Hub {
                repo,
                split,
                revision,
            } => self.load_hub(repo, split, revision.as_deref())?,
        };

        tracing::info!(
            records = dataset.len(),
            classes = dataset.labels().len(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    fn load_hub(
        &self,
        repo: &str,
        split: &str,
        revision: Option<&str>,
    ) -> Result<ImageDataset, DatasetError> {
        let hub_dataset = hub::HubDataset::open(repo, revision, split)
            .map_err(|e| DatasetError::Hub(e.to_string()))?;
        let paths = hub_dataset
            .shards()
            .iter()
            .map(|shard| hub_dataset.fetch(shard))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| DatasetError::Hub(e.to_string()))?;
        self.load_shards(&paths)
    }

    /// Read local parquet shards, sampling `max_records` rows across all of
    /// them by global row index.
    pub(crate) fn load_shards(&self, paths: &[PathBuf]) -> Result<ImageDataset, DatasetError> {
        let readers = paths
            .iter()
            .map(ParquetShardReader::open)
            .collect::<Result<Vec<_>, _>>()?;
        let total: usize = readers.iter().map(ParquetShardReader::num_rows).sum();
        let selected = self
            .max_records
            .map(|n| sample_indices(total, n, self.seed));

        let mut records = Vec::new();
        let mut names: Option<Vec<String>> = None;
        let mut offset = 0;
        for (path, reader) in paths.iter().zip(&readers) {
            if names.is_none() {
                names = reader
                    .hf_metadata()
                    .and_then(|meta| hf_label_names(&meta, &self.label_column));
            }

            let rows = reader.num_rows();
            let local: Option<Vec<usize>> = selected.as_ref().map(|selected| {
                selected
                    .iter()
                    .filter(|&&i| i >= offset && i < offset + rows)
                    .map(|&i| i - offset)
                    .collect()
            });
            offset += rows;
            if local.as_ref().is_some_and(Vec::is_empty) {
                continue;
            }

            let mut shard_records =
                reader.read_records(&self.image_column, &self.label_column, local.as_deref())?;
            tracing::debug!(shard = %path.display(), rows = shard_records.len(), "read parquet shard");
            records.append(&mut shard_records);
        }

        if records.is_empty() {
            return Err(DatasetError::Empty);
        }

        let labels = match names {
            Some(names) => LabelMap::from_names(names)?,
            None if !self.label_names.is_empty() => LabelMap::from_names(self.label_names.clone())?,
            None => {
                let max = records.iter().map(|r| r.label).max().unwrap_or(0);
                LabelMap::numeric(max as usize + 1)?
            }
        };

        ImageDataset::new(records, labels)
    }
}
