//! LoRA types and data structures.

use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid adapter hyper-parameters.
#[derive(Debug, Error, PartialEq)]
pub enum LoraConfigError {
    #[error("LoRA rank must be positive")]
    ZeroRank,
    #[error("lora_dropout must be in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("target_modules is empty")]
    NoTargets,
    #[error("unsupported bias mode {0:?}; only \"none\" is supported")]
    UnsupportedBias(String),
}

/// Configuration from adapter_config.json (PEFT format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// LoRA rank (r parameter).
    #[serde(default = "default_rank")]
    pub r: usize,
    /// Scaling parameter (alpha).
    #[serde(default = "default_alpha")]
    pub lora_alpha: f32,
    /// Module name suffixes that receive an adapter.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    /// Dropout on the adapter input, active only while training.
    #[serde(default = "default_dropout")]
    pub lora_dropout: f32,
    /// Bias handling: "none", "all", "lora_only".
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Use rank-stabilized LoRA scaling.
    #[serde(default)]
    pub use_rslora: bool,
    /// Modules trained in full and stored with the adapter (the classifier head).
    #[serde(default = "default_modules_to_save")]
    pub modules_to_save: Vec<String>,
    /// Base model name/path for validation.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_rank() -> usize {
    16
}

fn default_alpha() -> f32 {
    16.0
}

fn default_target_modules() -> Vec<String> {
    vec!["query".to_string(), "value".to_string()]
}

fn default_dropout() -> f32 {
    0.1
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_modules_to_save() -> Vec<String> {
    vec!["classifier".to_string()]
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_rank(),
            lora_alpha: default_alpha(),
            target_modules: default_target_modules(),
            lora_dropout: default_dropout(),
            bias: default_bias(),
            use_rslora: false,
            modules_to_save: default_modules_to_save(),
            base_model_name_or_path: None,
            peft_type: default_peft_type(),
            task_type: None,
            inference_mode: false,
        }
    }
}

impl LoraConfig {
    /// Compute the scaling factor for LoRA.
    ///
    /// For standard LoRA: scale = alpha / rank
    /// For rsLoRA: scale = alpha / sqrt(rank)
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }

    /// Whether the module at `module_path` gets an adapter.
    ///
    /// `vit.encoder.layer.3.attention.attention.query` matches the target
    /// `query` as well as any longer dotted suffix of the path.
    pub fn matches_target(&self, module_path: &str) -> bool {
        self.target_modules
            .iter()
            .any(|target| suffix_match(module_path, target))
    }

    /// Whether the module at `module_path` is trained in full and saved.
    pub fn is_saved_module(&self, module_path: &str) -> bool {
        self.modules_to_save
            .iter()
            .any(|name| suffix_match(module_path, name))
    }

    pub fn validate(&self) -> Result<(), LoraConfigError> {
        if self.r == 0 {
            return Err(LoraConfigError::ZeroRank);
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(LoraConfigError::InvalidDropout(self.lora_dropout));
        }
        if self.target_modules.is_empty() {
            return Err(LoraConfigError::NoTargets);
        }
        if self.bias != "none" {
            return Err(LoraConfigError::UnsupportedBias(self.bias.clone()));
        }
        Ok(())
    }
}

fn suffix_match(path: &str, name: &str) -> bool {
    path == name
        || path
            .strip_suffix(name)
            .is_some_and(|head| head.ends_with('.'))
}

/// LoRA weights for a single layer (low-rank matrices A and B).
///
/// The LoRA computation is:
/// ```text
/// output = base_output + scale * (dropout(x) @ lora_a.T @ lora_b.T)
/// ```
///
/// Where:
/// - lora_a: [rank, input_dim]
/// - lora_b: [output_dim, rank]
/// - scale: alpha / rank
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Low-rank matrix A: [rank, input_dim].
    pub lora_a: Tensor,
    /// Low-rank matrix B: [output_dim, rank].
    pub lora_b: Tensor,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    /// Pre-computed scale (alpha / rank).
    pub scale: f32,
    /// Input dropout probability used in training mode.
    pub dropout: f32,
}

impl LoraAdapter {
    /// Create a new LoRA adapter.
    pub fn new(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: f32) -> Self {
        let scale = alpha / rank as f32;
        Self::with_scale(lora_a, lora_b, rank, alpha, scale)
    }

    /// Create with custom scaling factor.
    pub fn with_scale(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: f32, scale: f32) -> Self {
        Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scale,
            dropout: 0.0,
        }
    }

    /// Build an adapter with the scaling and dropout of `config`.
    pub fn from_config(lora_a: Tensor, lora_b: Tensor, config: &LoraConfig) -> Self {
        Self::with_scale(lora_a, lora_b, config.r, config.lora_alpha, config.scaling())
            .with_dropout(config.lora_dropout)
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Input dimension (from lora_a shape).
    pub fn input_dim(&self) -> usize {
        self.lora_a.dims()[1]
    }

    /// Output dimension (from lora_b shape).
    pub fn output_dim(&self) -> usize {
        self.lora_b.dims()[0]
    }

    /// Number of trainable values in A and B.
    pub fn num_parameters(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }

    /// Pre-merge scaling into lora_b for faster inference.
    ///
    /// After calling this, scale becomes 1.0 and the scaling is baked into lora_b.
    pub fn optimize(&mut self) -> candle_core::Result<()> {
        if (self.scale - 1.0).abs() > f32::EPSILON {
            self.lora_b = (&self.lora_b * self.scale as f64)?;
            self.scale = 1.0;
        }
        Ok(())
    }
}

/// One task's adapter: LoRA matrices per module plus the fully trained modules
/// (the classifier head) that were saved alongside them.
#[derive(Debug)]
pub struct LoraModel {
    /// Adapter name.
    pub name: String,
    /// Unique ID.
    pub id: u32,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    /// Adapters by module path (e.g. "vit.encoder.layer.0.attention.attention.query").
    pub adapters: HashMap<String, LoraAdapter>,
    /// Target modules this LoRA was trained for.
    pub target_modules: Vec<String>,
    /// Saved module tensors by name (e.g. "classifier.weight").
    pub saved_modules: HashMap<String, Tensor>,
}

impl LoraModel {
    /// Create a new empty LoRA model.
    pub fn new(name: impl Into<String>, id: u32, rank: usize, alpha: f32) -> Self {
        Self {
            name: name.into(),
            id,
            rank,
            alpha,
            adapters: HashMap::new(),
            target_modules: Vec::new(),
            saved_modules: HashMap::new(),
        }
    }

    /// Get adapter for a specific module path.
    pub fn get_adapter(&self, module_name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(module_name)
    }

    /// Add an adapter for a module.
    pub fn add_adapter(&mut self, module_name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(module_name.into(), adapter);
    }

    /// Number of layers with adapters.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// A saved full tensor, e.g. `saved_tensor("classifier.weight")`.
    pub fn saved_tensor(&self, name: &str) -> Option<&Tensor> {
        self.saved_modules.get(name)
    }

    /// Optimize all adapters by pre-merging scale into lora_b.
    pub fn optimize(&mut self) -> candle_core::Result<()> {
        for adapter in self.adapters.values_mut() {
            adapter.optimize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_lora_config_defaults() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 16);
        assert!((config.lora_alpha - 16.0).abs() < f32::EPSILON);
        assert_eq!(config.target_modules, vec!["query", "value"]);
        assert!((config.lora_dropout - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.modules_to_save, vec!["classifier"]);
        assert!((config.scaling() - 1.0).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_rslora_scaling() {
        let config = LoraConfig {
            r: 16,
            lora_alpha: 32.0,
            use_rslora: true,
            ..Default::default()
        };

        // rsLoRA scaling: alpha / sqrt(rank) = 32 / 4 = 8.0
        assert!((config.scaling() - 8.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_matches_target_by_suffix() {
        let config = LoraConfig::default();
        assert!(config.matches_target("vit.encoder.layer.0.attention.attention.query"));
        assert!(config.matches_target("value"));
        assert!(!config.matches_target("vit.encoder.layer.0.attention.attention.key"));
        assert!(!config.matches_target("vit.encoder.layer.0.attention.output.dense"));
        // A partial segment is not a match.
        assert!(!config.matches_target("vit.encoder.layer.0.subquery"));

        let dense = LoraConfig {
            target_modules: vec!["attention.output.dense".to_string()],
            ..Default::default()
        };
        assert!(dense.matches_target("vit.encoder.layer.1.attention.output.dense"));
        assert!(!dense.matches_target("vit.encoder.layer.1.output.dense"));

        assert!(config.is_saved_module("classifier"));
        assert!(!config.is_saved_module("vit.layernorm"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = LoraConfig { r: 0, ..Default::default() };
        assert_eq!(zero.validate(), Err(LoraConfigError::ZeroRank));

        let dropout = LoraConfig { lora_dropout: 1.0, ..Default::default() };
        assert_eq!(dropout.validate(), Err(LoraConfigError::InvalidDropout(1.0)));

        let empty = LoraConfig { target_modules: vec![], ..Default::default() };
        assert_eq!(empty.validate(), Err(LoraConfigError::NoTargets));

        let bias = LoraConfig { bias: "all".to_string(), ..Default::default() };
        assert!(matches!(bias.validate(), Err(LoraConfigError::UnsupportedBias(_))));
    }

    #[test]
    fn test_lora_config_deserialize_peft_file() {
        let json = r#"{
            "base_model_name_or_path": "google/vit-base-patch16-224-in21k",
            "bias": "none",
            "inference_mode": true,
            "lora_alpha": 16,
            "lora_dropout": 0.1,
            "modules_to_save": ["classifier"],
            "peft_type": "LORA",
            "r": 16,
            "target_modules": ["query", "value"],
            "task_type": null
        }"#;

        let config: LoraConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.r, 16);
        assert!(config.inference_mode);
        assert_eq!(config.peft_type, "LORA");
        assert_eq!(
            config.base_model_name_or_path.as_deref(),
            Some("google/vit-base-patch16-224-in21k")
        );

        let minimal: LoraConfig = serde_json::from_str(r#"{"r": 8}"#).unwrap();
        assert_eq!(minimal.r, 8);
        assert_eq!(minimal.target_modules, vec!["query", "value"]);
    }

    #[test]
    fn test_lora_adapter_dimensions() {
        let device = Device::Cpu;
        let lora_a = Tensor::zeros((8, 512), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((256, 8), DType::F32, &device).unwrap();

        let adapter = LoraAdapter::new(lora_a, lora_b, 8, 16.0);

        assert_eq!(adapter.input_dim(), 512);
        assert_eq!(adapter.output_dim(), 256);
        assert_eq!(adapter.num_parameters(), 8 * 512 + 256 * 8);
        assert!((adapter.scale - 2.0).abs() < f32::EPSILON);
        assert_eq!(adapter.dropout, 0.0);
    }

    #[test]
    fn test_lora_adapter_optimize() {
        let device = Device::Cpu;
        let lora_a = Tensor::ones((8, 16), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((32, 8), DType::F32, &device).unwrap();

        let mut adapter = LoraAdapter::new(lora_a, lora_b, 8, 16.0);
        adapter.optimize().unwrap();
        assert!((adapter.scale - 1.0).abs() < f32::EPSILON);

        let lora_b_values: Vec<f32> = adapter.lora_b.flatten_all().unwrap().to_vec1().unwrap();
        assert!(lora_b_values.iter().all(|&v| (v - 2.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_lora_model_saved_modules() {
        let device = Device::Cpu;
        let mut model = LoraModel::new("model1", 1, 8, 16.0);

        let adapter = LoraAdapter::new(
            Tensor::zeros((8, 32), DType::F32, &device).unwrap(),
            Tensor::zeros((32, 8), DType::F32, &device).unwrap(),
            8,
            16.0,
        );
        model.add_adapter("vit.encoder.layer.0.attention.attention.query", adapter);
        model.saved_modules.insert(
            "classifier.weight".to_string(),
            Tensor::zeros((3, 32), DType::F32, &device).unwrap(),
        );

        assert_eq!(model.num_adapters(), 1);
        assert!(model.get_adapter("vit.encoder.layer.0.attention.attention.key").is_none());
        assert_eq!(model.saved_tensor("classifier.weight").unwrap().dims(), &[3, 32]);
    }
}
