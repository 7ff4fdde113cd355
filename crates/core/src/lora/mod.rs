//! LoRA (Low-Rank Adaptation) support for efficient fine-tuning.
//!
//! Adapters are registered on [`LinearWithLora`] layers by name and selected
//! per forward pass through a [`LoraContext`], so one frozen backbone can
//! serve several task adapters without duplicating its weights.

mod context;
mod linear;
mod loader;
mod manager;
mod types;

pub use context::LoraContext;
pub use linear::LinearWithLora;
pub(crate) use linear::to_f32;
pub use loader::{peft_tensor_name, LoraLoadError, LoraLoader, PEFT_PREFIX};
pub use manager::{LoadedAdapter, LoraManager, LoraManagerConfig, LoraManagerError};
pub use types::{LoraAdapter, LoraConfig, LoraConfigError, LoraModel};
