//! Lazily transformed dataset splits.

use candle_core::{Device, Tensor};

use super::{ImageProcessor, PreprocessError};
use crate::dataset::ImageDataset;

/// One batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, S, S]`
    pub pixel_values: Tensor,
    /// `[B]`, u32
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.pixel_values.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A split paired with the processor. Images are decoded and transformed only
/// when a batch is requested, so nothing is materialized up front.
#[derive(Debug, Clone, Copy)]
pub struct TransformedSplit<'a> {
    dataset: &'a ImageDataset,
    processor: &'a ImageProcessor,
}

impl<'a> TransformedSplit<'a> {
    pub fn new(dataset: &'a ImageDataset, processor: &'a ImageProcessor) -> Self {
        Self { dataset, processor }
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &'a ImageDataset {
        self.dataset
    }

    pub fn device(&self) -> &Device {
        self.processor.device()
    }

    /// Transform the records at `indices` into a batch.
    pub fn batch(&self, indices: &[usize]) -> Result<Batch, PreprocessError> {
        if indices.is_empty() {
            return Err(PreprocessError::EmptyBatch);
        }

        let mut pixels = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let record = self
                .dataset
                .get(index)
                .ok_or(PreprocessError::IndexOutOfRange {
                    index,
                    len: self.dataset.len(),
                })?;
            let image = record.decode()?;
            pixels.push(self.processor.preprocess(&image)?);
            labels.push(record.label);
        }

        Ok(Batch {
            pixel_values: Tensor::stack(&pixels, 0)?,
            labels: Tensor::new(labels, self.processor.device())?,
        })
    }

    /// Batches over `order` in chunks of `batch_size`; the last one may be short.
    pub fn batches<'s>(
        &'s self,
        order: &'s [usize],
        batch_size: usize,
    ) -> impl Iterator<Item = Result<Batch, PreprocessError>> + 's {
        order
            .chunks(batch_size.max(1))
            .map(move |chunk| self.batch(chunk))
    }

    /// Batches in record order.
    pub fn sequential_order(&self) -> Vec<usize> {
        (0..self.dataset.len()).collect()
    }
}
