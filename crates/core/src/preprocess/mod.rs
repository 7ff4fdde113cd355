//! Image preprocessing for the ViT backbone.
//!
//! Each image is resized so its shorter edge matches the backbone's input
//! size, center-cropped to a square, rescaled to `[0, 1]` and normalized per
//! channel with the backbone's mean/std. The transform is deterministic.

mod transform;

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::DatasetError;

pub use transform::{Batch, TransformedSplit};

/// Error type for preprocessing.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("invalid preprocessor config: {0}")]
    InvalidConfig(String),
    #[error("failed to load image: {0}")]
    ImageLoad(#[from] DatasetError),
    #[error("batch is empty")]
    EmptyBatch,
    #[error("index {index} out of range for split of {len} records")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// `size` / `crop_size` as found in HF preprocessor configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Edge(usize),
    HeightWidth { height: usize, width: usize },
    ShortestEdge { shortest_edge: usize },
}

impl ImageSize {
    /// The edge length used for resizing and square cropping.
    pub fn edge(&self) -> usize {
        match self {
            ImageSize::Edge(n) => *n,
            ImageSize::HeightWidth { height, .. } => *height,
            ImageSize::ShortestEdge { shortest_edge } => *shortest_edge,
        }
    }
}

/// HF `preprocessor_config.json` (the fields this pipeline uses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_size")]
    pub size: ImageSize,
    #[serde(default = "default_true")]
    pub do_center_crop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_size: Option<ImageSize>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f64,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_half")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_half")]
    pub image_std: [f32; 3],
}

fn default_true() -> bool {
    true
}

fn default_size() -> ImageSize {
    ImageSize::Edge(224)
}

fn default_rescale_factor() -> f64 {
    1.0 / 255.0
}

fn default_half() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self::for_image_size(224)
    }
}

impl ImageProcessorConfig {
    /// ViT defaults (mean = std = 0.5) for a given input size.
    pub fn for_image_size(image_size: usize) -> Self {
        Self {
            do_resize: true,
            size: ImageSize::Edge(image_size),
            do_center_crop: true,
            crop_size: None,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_half(),
            image_std: default_half(),
        }
    }

    /// Edge of the square the pipeline outputs.
    pub fn crop_edge(&self) -> usize {
        self.crop_size
            .as_ref()
            .map(ImageSize::edge)
            .unwrap_or_else(|| self.size.edge())
    }

    fn validate(&self) -> Result<(), PreprocessError> {
        if self.size.edge() == 0 || self.crop_edge() == 0 {
            return Err(PreprocessError::InvalidConfig(
                "image size must be positive".to_string(),
            ));
        }
        if self.do_normalize && self.image_std.iter().any(|s| *s <= 0.0) {
            return Err(PreprocessError::InvalidConfig(format!(
                "image_std must be positive, got {:?}",
                self.image_std
            )));
        }
        Ok(())
    }
}

/// Turns decoded images into normalized `[3, S, S]` tensors.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    config: ImageProcessorConfig,
    device: Device,
    dtype: DType,
}

impl ImageProcessor {
    pub fn new(
        config: ImageProcessorConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, PreprocessError> {
        config.validate()?;
        Ok(Self {
            config,
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    /// Output edge length.
    pub fn image_size(&self) -> usize {
        self.config.crop_edge()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Resize and center-crop, returning the RGB square.
    pub fn resize_and_crop(&self, image: &DynamicImage) -> DynamicImage {
        let crop = self.config.crop_edge() as u32;
        let mut image = image.clone();

        if self.config.do_resize {
            let edge = self.config.size.edge() as u32;
            let (w, h) = (image.width(), image.height());
            // Shorter edge to `edge`, longer edge scaled and truncated.
            let (nw, nh) = if w <= h {
                (edge, ((h as u64 * edge as u64) / w.max(1) as u64) as u32)
            } else {
                (((w as u64 * edge as u64) / h.max(1) as u64) as u32, edge)
            };
            image = image.resize_exact(nw.max(1), nh.max(1), FilterType::Triangle);
        }

        if self.config.do_center_crop {
            let (w, h) = (image.width(), image.height());
            if w < crop || h < crop {
                image = image.resize_exact(crop, crop, FilterType::Triangle);
            } else {
                let left = ((w - crop) as f64 / 2.0).round() as u32;
                let top = ((h - crop) as f64 / 2.0).round() as u32;
                image = image.crop_imm(left, top, crop, crop);
            }
        } else if image.width() != crop || image.height() != crop {
            image = image.resize_exact(crop, crop, FilterType::Triangle);
        }

        image
    }

    /// Full transform of one image into a `[3, S, S]` tensor.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor, PreprocessError> {
        let square = self.resize_and_crop(image).to_rgb8();
        let (w, h) = (square.width() as usize, square.height() as usize);
        let raw = square.into_raw();

        let rescale = if self.config.do_rescale {
            self.config.rescale_factor as f32
        } else {
            1.0
        };

        // HWC u8 -> CHW f32
        let mut data = vec![0f32; 3 * h * w];
        for c in 0..3 {
            let (mean, std) = if self.config.do_normalize {
                (self.config.image_mean[c], self.config.image_std[c])
            } else {
                (0.0, 1.0)
            };
            let plane = &mut data[c * h * w..(c + 1) * h * w];
            for (i, out) in plane.iter_mut().enumerate() {
                let v = raw[i * 3 + c] as f32 * rescale;
                *out = (v - mean) / std;
            }
        }

        let tensor = Tensor::from_vec(data, (3, h, w), &self.device)?;
        Ok(tensor.to_dtype(self.dtype)?)
    }

    /// Preprocess several images into a `[B, 3, S, S]` batch.
    pub fn preprocess_batch(&self, images: &[DynamicImage]) -> Result<Tensor, PreprocessError> {
        if images.is_empty() {
            return Err(PreprocessError::EmptyBatch);
        }
        let tensors = images
            .iter()
            .map(|img| self.preprocess(img))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }
}
