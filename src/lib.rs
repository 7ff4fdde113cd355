//! Multi-task LoRA fine-tuning and adapter composition for ViT image classifiers.
//!
//! This crate re-exports [`vitlora_core`]; the end-to-end tests in `tests/`
//! exercise it through this facade.

pub use vitlora_core::*;
