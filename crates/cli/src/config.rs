//! Configuration persistence for the vitlora CLI.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/vitlora/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use vitlora_core::fetch::{SAMPLE_CAT_IMAGE, SAMPLE_FOOD_IMAGE};
use vitlora_core::hub::DEFAULT_BACKBONE;
use vitlora_core::lora::LoraConfig;
use vitlora_core::pipeline::{BackboneSpec, PipelineSettings};
use vitlora_core::task::TaskConfig;
use vitlora_core::train::TrainingArgs;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backbone identifier (HuggingFace Hub format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// HuggingFace model revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Local backbone snapshot; used instead of downloading `model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,

    /// Compute device (cpu, cuda).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Default log level when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Directory that receives one artifact directory per task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,

    /// Query images for `vitlora demo` (URL or path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food_image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat_image: Option<String>,

    /// Adapter hyperparameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraConfig>,

    /// Trainer hyperparameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingArgs>,

    /// Tasks to train; the two built-in tasks when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskConfig>>,
}

impl PipelineConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vitlora").join("config.toml"))
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Every field set to its built-in default, as written by `init-config`.
    pub fn with_defaults() -> Self {
        Self {
            model: Some(DEFAULT_BACKBONE.to_string()),
            revision: None,
            model_dir: None,
            device: Some("cpu".to_string()),
            log_level: Some("info".to_string()),
            output_root: Some(PathBuf::from(".")),
            food_image: Some(SAMPLE_FOOD_IMAGE.to_string()),
            cat_image: Some(SAMPLE_CAT_IMAGE.to_string()),
            lora: Some(LoraConfig::default()),
            training: Some(TrainingArgs::default()),
            tasks: Some(TaskConfig::presets()),
        }
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &PipelineConfig) {
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.revision.is_some() {
            self.revision = other.revision.clone();
        }
        if other.model_dir.is_some() {
            self.model_dir = other.model_dir.clone();
        }
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
        if other.output_root.is_some() {
            self.output_root = other.output_root.clone();
        }
        if other.food_image.is_some() {
            self.food_image = other.food_image.clone();
        }
        if other.cat_image.is_some() {
            self.cat_image = other.cat_image.clone();
        }
        if other.lora.is_some() {
            self.lora = other.lora.clone();
        }
        if other.training.is_some() {
            self.training = other.training.clone();
        }
        if other.tasks.is_some() {
            self.tasks = other.tasks.clone();
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn backbone(&self) -> BackboneSpec {
        BackboneSpec {
            model_id: self
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKBONE.to_string()),
            revision: self.revision.clone(),
            local_dir: self.model_dir.clone(),
        }
    }

    /// Open the configured device.
    pub fn device(&self) -> anyhow::Result<Device> {
        parse_device(self.device.as_deref().unwrap_or("cpu"))
    }

    /// Configured tasks (or the presets) with `output_root` applied.
    pub fn tasks(&self) -> Vec<TaskConfig> {
        let tasks = self.tasks.clone().unwrap_or_else(TaskConfig::presets);
        match &self.output_root {
            Some(root) => tasks.into_iter().map(|t| t.with_output_root(root)).collect(),
            None => tasks,
        }
    }

    /// Resolve into library settings.
    pub fn settings(&self, device: Device) -> PipelineSettings {
        PipelineSettings {
            backbone: self.backbone(),
            lora: self.lora.clone().unwrap_or_default(),
            training: self.training.clone().unwrap_or_default(),
            tasks: self.tasks(),
            device,
        }
    }
}

/// `cpu`, `cuda` or `cuda:<ordinal>`.
pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    match name.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => Ok(Device::new_cuda(ordinal.parse()?)?),
            None => anyhow::bail!("unknown device {name:?} (expected cpu, cuda, cuda:N)"),
        },
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
