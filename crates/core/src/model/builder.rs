//! Wraps a frozen backbone with fresh LoRA adapters and a classifier head.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::{ClassifierHead, ModelError, VitBackbone, VitConfig};
use crate::labels::LabelMap;
use crate::lora::{LoraAdapter, LoraConfig, LoraContext};

/// Dtype of the frozen backbone weights. Trainable parameters stay f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// f16 on CUDA, f32 on CPU.
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn resolve(self, device: &Device) -> DType {
        match self {
            Precision::Auto if device.is_cuda() => DType::F16,
            Precision::Auto | Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Precision::Auto),
            "f32" | "fp32" => Ok(Precision::F32),
            "f16" | "fp16" => Ok(Precision::F16),
            "bf16" => Ok(Precision::Bf16),
            other => Err(format!("unknown precision {other:?} (expected auto, f32, f16, bf16)")),
        }
    }
}

/// Trainable vs total parameter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterCount {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCount {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

fn with_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            with_thousands(self.trainable),
            with_thousands(self.total),
            self.trainable_percent()
        )
    }
}

/// Builds a [`LoraImageClassifier`] for one task.
#[derive(Debug, Clone, Default)]
pub struct AdapterModelBuilder {
    lora: LoraConfig,
}

impl AdapterModelBuilder {
    pub fn new(lora: LoraConfig) -> Self {
        Self { lora }
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora
    }

    /// Load the backbone from `backbone_vb`, add LoRA adapters on every module
    /// matched by the config and a classifier head sized for `labels`.
    ///
    /// LoRA A starts Kaiming-uniform, LoRA B at zero, so the adapted model
    /// initially computes exactly what the backbone does.
    pub fn build(
        &self,
        backbone_vb: VarBuilder,
        vit_config: &VitConfig,
        labels: &LabelMap,
        adapter_name: &str,
    ) -> Result<LoraImageClassifier, ModelError> {
        self.lora.validate()?;
        if labels.is_empty() {
            return Err(ModelError::NoLabels);
        }

        let device = backbone_vb.device().clone();
        let mut backbone = VitBackbone::new(vit_config, backbone_vb.clone())?;

        let targets = backbone.target_modules(&self.lora);
        if targets.is_empty() {
            return Err(ModelError::NoTargetModules(self.lora.target_modules.clone()));
        }

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let r = self.lora.r;
        for target in &targets {
            let vb_m = vb.pp(&target.path);
            // kaiming_uniform(a = sqrt(5)) bound for a [r, in] matrix
            let bound = 1.0 / (target.in_features as f64).sqrt();
            let lora_a = vb_m.get_with_hints(
                (r, target.in_features),
                "lora_A.weight",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?;
            let lora_b =
                vb_m.get_with_hints((target.out_features, r), "lora_B.weight", Init::Const(0.0))?;
            backbone.register_module_adapter(
                adapter_name,
                &target.path,
                LoraAdapter::from_config(lora_a, lora_b, &self.lora),
            )?;
        }

        let hidden = vit_config.hidden_size;
        let num_labels = labels.len();
        let head = ClassifierHead::new(hidden, num_labels, vb.pp("classifier"))?;
        seed_head_from_checkpoint(&backbone_vb, &mut varmap, hidden, num_labels)?;

        let trainable: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        let parameter_count = ParameterCount {
            trainable,
            total: vit_config.num_backbone_parameters() + trainable,
        };
        tracing::info!(
            adapter = adapter_name,
            modules = targets.len(),
            rank = r,
            labels = num_labels,
            "{parameter_count}"
        );

        Ok(LoraImageClassifier {
            backbone,
            head,
            varmap,
            lora: self.lora.clone(),
            labels: labels.clone(),
            adapter_name: adapter_name.to_string(),
            parameter_count,
        })
    }
}

/// Copy a checkpoint's `classifier` into the fresh head when shapes match.
fn seed_head_from_checkpoint(
    backbone_vb: &VarBuilder,
    varmap: &mut VarMap,
    hidden: usize,
    num_labels: usize,
) -> Result<(), ModelError> {
    if !backbone_vb.contains_tensor("classifier.weight") {
        return Ok(());
    }
    match (
        backbone_vb.get((num_labels, hidden), "classifier.weight"),
        backbone_vb.get(num_labels, "classifier.bias"),
    ) {
        (Ok(weight), Ok(bias)) => {
            varmap.set_one("classifier.weight", weight.to_dtype(DType::F32)?)?;
            varmap.set_one("classifier.bias", bias.to_dtype(DType::F32)?)?;
            tracing::info!("classifier head initialised from checkpoint");
        }
        _ => {
            tracing::warn!(
                num_labels,
                "checkpoint classifier does not match the label count; reinitialising head"
            );
        }
    }
    Ok(())
}

/// Backbone + trainable adapter + head for one task.
pub struct LoraImageClassifier {
    backbone: VitBackbone,
    head: ClassifierHead,
    varmap: VarMap,
    lora: LoraConfig,
    labels: LabelMap,
    adapter_name: String,
    parameter_count: ParameterCount,
}

impl LoraImageClassifier {
    /// Logits `[B, num_labels]` (f32). `train` enables LoRA dropout.
    pub fn forward(&self, pixel_values: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let ctx = if train {
            LoraContext::training(&self.adapter_name)
        } else {
            LoraContext::with_adapter(&self.adapter_name)
        };
        let features = self.backbone.cls_features(pixel_values, &ctx)?;
        self.head.forward(&features)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Copies of every trainable tensor by name
    /// (`vit.encoder.layer.0.attention.attention.query.lora_A.weight`, `classifier.weight`, ...).
    pub fn trainable_tensors(&self) -> candle_core::Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite trainable tensors with a snapshot from [`Self::trainable_tensors`].
    pub fn restore(&self, snapshot: &HashMap<String, Tensor>) -> candle_core::Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
        for (name, var) in data.iter() {
            match snapshot.get(name) {
                Some(tensor) => var.set(tensor)?,
                None => candle_core::bail!("snapshot has no tensor {name}"),
            }
        }
        Ok(())
    }

    pub fn backbone(&self) -> &VitBackbone {
        &self.backbone
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn vit_config(&self) -> &VitConfig {
        self.backbone.config()
    }

    pub fn parameter_count(&self) -> ParameterCount {
        self.parameter_count
    }

    pub fn device(&self) -> &Device {
        self.backbone.device()
    }
}
