//! Shared test utilities for vitlora-core.
//!
//! This module provides a tiny deterministic ViT backbone, image fixtures,
//! and parquet shard writers for integration testing without network access.

mod backbone;
mod fixtures;
mod tiny_config;

pub use backbone::{tiny_backbone_tensors, tiny_backbone_varbuilder, write_tiny_backbone};
pub use fixtures::{color_image, encoded_png, write_color_image_folder, write_parquet_shard};
pub use tiny_config::{tiny_processor_config, tiny_vit_config};
