//! LoRA adapter loading from HuggingFace PEFT format.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use super::types::{LoraAdapter, LoraConfig, LoraConfigError, LoraModel};

/// Errors that can occur during LoRA loading.
#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("adapter config not found at {0}")]
    ConfigNotFound(String),
    #[error("adapter weights not found at {0}")]
    WeightsNotFound(String),
    #[error("failed to parse adapter config: {0}")]
    ConfigParse(String),
    #[error("invalid adapter config: {0}")]
    Config(#[from] LoraConfigError),
    #[error("failed to load weights: {0}")]
    WeightsLoad(String),
    #[error("mismatched lora_a and lora_b shapes for {module}: a={a_shape:?}, b={b_shape:?}")]
    ShapeMismatch {
        module: String,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
    },
    #[error("missing lora_a or lora_b for module {0}")]
    IncompleteAdapter(String),
    #[error("adapter contains no LoRA weights")]
    NoAdapters,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix PEFT puts in front of every saved tensor name.
pub const PEFT_PREFIX: &str = "base_model.model.";

/// LoRA adapter loader for HuggingFace PEFT format.
///
/// Loads adapters from directories containing:
/// - `adapter_config.json`: PEFT configuration
/// - `adapter_model.safetensors` or `adapter_model.bin`: Weights
///
/// Tensors that belong to `modules_to_save` (the classifier head) are kept
/// as full tensors in [`LoraModel::saved_modules`].
pub struct LoraLoader {
    device: Device,
    dtype: DType,
}

impl LoraLoader {
    /// Create a new loader for the specified device and dtype.
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// Load a LoRA adapter from a directory.
    pub fn load(
        &self,
        adapter_path: impl AsRef<Path>,
        name: impl Into<String>,
        id: u32,
    ) -> Result<LoraModel, LoraLoadError> {
        let path = adapter_path.as_ref();
        let config = Self::load_config(path)?;
        let weights = self.load_weights(path)?;
        self.build_model(name.into(), id, &config, weights)
    }

    /// Load and validate `adapter_config.json`.
    pub fn load_config(path: &Path) -> Result<LoraConfig, LoraLoadError> {
        let config_path = path.join("adapter_config.json");
        if !config_path.exists() {
            return Err(LoraLoadError::ConfigNotFound(
                config_path.display().to_string(),
            ));
        }

        let config_str = std::fs::read_to_string(&config_path)?;
        let config: LoraConfig = serde_json::from_str(&config_str)
            .map_err(|e| LoraLoadError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load weights from safetensors or bin format.
    fn load_weights(&self, path: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let safetensors_path = path.join("adapter_model.safetensors");
        if safetensors_path.exists() {
            let tensors = candle_core::safetensors::load(&safetensors_path, &self.device)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            return self.convert(tensors);
        }

        let bin_path = path.join("adapter_model.bin");
        if bin_path.exists() {
            let tensors = candle_core::pickle::read_all(&bin_path)
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            return self.convert(tensors);
        }

        Err(LoraLoadError::WeightsNotFound(path.display().to_string()))
    }

    fn convert(
        &self,
        tensors: impl IntoIterator<Item = (String, Tensor)>,
    ) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let mut result = HashMap::new();
        for (name, tensor) in tensors {
            let tensor = tensor
                .to_device(&self.device)
                .and_then(|t| t.to_dtype(self.dtype))
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
            result.insert(name, tensor);
        }
        Ok(result)
    }

    /// Build LoraModel from config and weights.
    fn build_model(
        &self,
        name: String,
        id: u32,
        config: &LoraConfig,
        weights: HashMap<String, Tensor>,
    ) -> Result<LoraModel, LoraLoadError> {
        let mut model = LoraModel::new(&name, id, config.r, config.lora_alpha);
        model.target_modules = config.target_modules.clone();

        let (module_weights, saved) = split_weights(weights, config);
        model.saved_modules = saved;

        for (module_name, tensors) in module_weights {
            let lora_a = tensors
                .get("lora_A")
                .or_else(|| tensors.get("lora_a"))
                .ok_or_else(|| LoraLoadError::IncompleteAdapter(module_name.clone()))?;
            let lora_b = tensors
                .get("lora_B")
                .or_else(|| tensors.get("lora_b"))
                .ok_or_else(|| LoraLoadError::IncompleteAdapter(module_name.clone()))?;

            // PEFT layout: lora_A [rank, in], lora_B [out, rank]
            let a_dims = lora_a.dims();
            let b_dims = lora_b.dims();
            if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[0] != b_dims[1] {
                return Err(LoraLoadError::ShapeMismatch {
                    module: module_name,
                    a_shape: a_dims.to_vec(),
                    b_shape: b_dims.to_vec(),
                });
            }

            // Inference adapters never use dropout.
            let adapter = LoraAdapter::from_config(lora_a.clone(), lora_b.clone(), config)
                .with_dropout(0.0);
            model.add_adapter(module_name, adapter);
        }

        if model.num_adapters() == 0 {
            return Err(LoraLoadError::NoAdapters);
        }

        tracing::debug!(
            adapter = %name,
            modules = model.num_adapters(),
            saved = model.saved_modules.len(),
            "loaded LoRA adapter"
        );
        Ok(model)
    }
}

type GroupedWeights = HashMap<String, HashMap<String, Tensor>>;

/// Group LoRA weights by module and pull out the saved full modules.
fn split_weights(
    weights: HashMap<String, Tensor>,
    config: &LoraConfig,
) -> (GroupedWeights, HashMap<String, Tensor>) {
    let mut grouped: GroupedWeights = HashMap::new();
    let mut saved = HashMap::new();

    for (full_name, tensor) in weights {
        if let Some((module_path, lora_type)) = parse_weight_name(&full_name) {
            grouped
                .entry(module_path)
                .or_default()
                .insert(lora_type, tensor);
        } else if let Some(saved_name) = parse_saved_name(&full_name, config) {
            saved.insert(saved_name, tensor);
        } else {
            tracing::warn!(tensor = %full_name, "ignoring unexpected adapter tensor");
        }
    }

    (grouped, saved)
}

fn strip_prefixes(name: &str) -> &str {
    name.strip_prefix(PEFT_PREFIX)
        .or_else(|| name.strip_prefix("base_model."))
        .unwrap_or(name)
}

/// Parse a weight name to extract module path and LoRA type.
///
/// - `base_model.model.vit.encoder.layer.0.attention.attention.query.lora_A.weight`
///   -> ("vit.encoder.layer.0.attention.attention.query", "lora_A")
fn parse_weight_name(name: &str) -> Option<(String, String)> {
    let name = strip_prefixes(name);
    let name = name.strip_suffix(".weight").unwrap_or(name);
    // Drop an adapter-name segment (".lora_A.default") if present.
    let name = name.strip_suffix(".default").unwrap_or(name);

    for lora_type in ["lora_A", "lora_B", "lora_a", "lora_b"] {
        if let Some(module_path) = name.strip_suffix(&format!(".{lora_type}")) {
            return Some((module_path.to_string(), lora_type.to_string()));
        }
    }
    None
}

/// Name of a saved full tensor relative to the model, e.g. `classifier.weight`.
///
/// Accepts both the flattened PEFT form (`classifier.weight`) and the
/// wrapper form (`classifier.modules_to_save.default.weight`).
fn parse_saved_name(name: &str, config: &LoraConfig) -> Option<String> {
    let name = strip_prefixes(name);
    let name = name
        .replace(".modules_to_save.default.", ".")
        .replace(".modules_to_save.", ".");
    let (module, _param) = name.rsplit_once('.')?;
    config.is_saved_module(module).then_some(name)
}

/// PEFT name of a saved tensor: `classifier.weight` -> `base_model.model.classifier.weight`.
pub fn peft_tensor_name(name: &str) -> String {
    format!("{PEFT_PREFIX}{name}")
}
