//! Labeled image datasets and their train/test splits.
//!
//! Records keep the encoded image (or its path) and are decoded lazily by the
//! preprocessing stage, so a split of a few thousand images stays cheap to hold.

mod folder;
mod shards;
mod source;

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::labels::{LabelError, LabelMap};

pub use shards::{hf_label_names, ParquetShardReader};
pub use source::{DatasetSource, DatasetSpec};

/// Errors from loading or splitting datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),
    #[error("hub error: {0}")]
    Hub(String),
    #[error("column {column:?} not found in {file}")]
    MissingColumn { column: String, file: String },
    #[error("unsupported value in column {column:?}: {found}")]
    UnsupportedValue { column: String, found: String },
    #[error("dataset is empty")]
    Empty,
    #[error("dataset has {0} record(s); at least 2 are needed for a train/test split")]
    TooSmallToSplit(usize),
    #[error("invalid test fraction {0}; expected a value in (0, 1)")]
    InvalidTestFraction(f64),
    #[error("label id {id} is out of range for {num_labels} label(s)")]
    UnknownLabel { id: i64, num_labels: usize },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("label error: {0}")]
    Labels(#[from] LabelError),
}

/// Where a record's pixels live.
#[derive(Debug, Clone)]
pub enum RecordImage {
    /// Encoded image bytes (PNG/JPEG/WebP) read from a parquet shard.
    Encoded(Arc<[u8]>),
    /// Image file on disk.
    Path(PathBuf),
}

/// One labeled example.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub image: RecordImage,
    pub label: u32,
}

impl ImageRecord {
    pub fn new(image: RecordImage, label: u32) -> Self {
        Self { image, label }
    }

    /// Decode the image.
    pub fn decode(&self) -> Result<DynamicImage, DatasetError> {
        let image = match &self.image {
            RecordImage::Encoded(bytes) => image::load_from_memory(bytes)?,
            RecordImage::Path(path) => image::open(path)?,
        };
        Ok(image)
    }
}

/// Records of one dataset (or one split of it) with the dataset's label mapping.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    records: Vec<ImageRecord>,
    labels: LabelMap,
}

/// Disjoint train and held-out splits of a dataset.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageDataset,
    pub test: ImageDataset,
}

impl ImageDataset {
    /// Create a dataset, checking every label id against the mapping.
    pub fn new(records: Vec<ImageRecord>, labels: LabelMap) -> Result<Self, DatasetError> {
        if let Some(bad) = records.iter().find(|r| r.label as usize >= labels.len()) {
            return Err(DatasetError::UnknownLabel {
                id: bad.label as i64,
                num_labels: labels.len(),
            });
        }
        Ok(Self { records, labels })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ImageRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Keep a seeded random subset of `n` records, in their original order.
    ///
    /// Records are drawn uniformly from the whole dataset, so a cap smaller
    /// than the first class still sees every class in proportion.
    pub fn sample(self, n: usize, seed: u64) -> Self {
        if n >= self.records.len() {
            return self;
        }
        let keep = sample_indices(self.records.len(), n, seed);
        let mut keep = keep.into_iter().peekable();
        let records = self
            .records
            .into_iter()
            .enumerate()
            .filter_map(|(i, record)| keep.next_if_eq(&i).map(|_| record))
            .collect();
        Self {
            records,
            labels: self.labels,
        }
    }

    /// Randomized split into train and test parts.
    ///
    /// The test part holds `ceil(len * test_fraction)` records, clamped so that
    /// both parts are non-empty. The same seed always yields the same split.
    pub fn train_test_split(
        &self,
        test_fraction: f64,
        seed: u64,
    ) -> Result<DatasetSplits, DatasetError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(DatasetError::InvalidTestFraction(test_fraction));
        }
        let n = self.records.len();
        if n < 2 {
            return Err(DatasetError::TooSmallToSplit(n));
        }

        let n_test = ((n as f64 * test_fraction).ceil() as usize).clamp(1, n - 1);

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let (test_idx, train_idx) = indices.split_at(n_test);
        let pick = |idx: &[usize]| -> Vec<ImageRecord> {
            idx.iter().map(|&i| self.records[i].clone()).collect()
        };

        Ok(DatasetSplits {
            train: ImageDataset {
                records: pick(train_idx),
                labels: self.labels.clone(),
            },
            test: ImageDataset {
                records: pick(test_idx),
                labels: self.labels.clone(),
            },
        })
    }
}

/// `n` distinct indices below `total`, chosen with `seed`, ascending.
pub(crate) fn sample_indices(total: usize, n: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..total).collect();
    if n < total {
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        indices.truncate(n);
        indices.sort_unstable();
    }
    indices
}
