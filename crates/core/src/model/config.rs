use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// HF ViT `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitConfig {
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id2label: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label2id: Option<HashMap<String, serde_json::Value>>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_architectures() -> Vec<String> {
    vec!["ViTModel".to_string()]
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_qkv_bias() -> bool {
    true
}

impl Default for VitConfig {
    fn default() -> Self {
        // google/vit-base-patch16-224-in21k
        Self {
            architectures: default_architectures(),
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            num_channels: default_num_channels(),
            layer_norm_eps: default_layer_norm_eps(),
            hidden_act: default_hidden_act(),
            qkv_bias: default_qkv_bias(),
            id2label: None,
            label2id: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl VitConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Tokens per image: patches plus the CLS token.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }

    /// Exact parameter count of the encoder (embeddings, blocks, final norm).
    ///
    /// Pooler and classifier weights that some checkpoints carry are excluded.
    pub fn num_backbone_parameters(&self) -> usize {
        let h = self.hidden_size;
        let i = self.intermediate_size;
        let qkv_bias = if self.qkv_bias { 3 * h } else { 0 };

        let embeddings = h * self.num_channels * self.patch_size * self.patch_size
            + h // patch projection bias
            + h // cls token
            + self.seq_len() * h;

        let attention = 3 * h * h + qkv_bias + h * h + h;
        let mlp = h * i + i + i * h + h;
        let norms = 2 * 2 * h;
        let block = attention + mlp + norms;

        embeddings + self.num_hidden_layers * block + 2 * h
    }
}
