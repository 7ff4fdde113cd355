use crate::model::VitConfig;
use crate::preprocess::ImageProcessorConfig;

/// Create a tiny ViT config for testing (2 layers, 32 hidden, 2 heads, 32px
/// images in 8px patches). About 24k backbone parameters.
pub fn tiny_vit_config() -> VitConfig {
    VitConfig {
        architectures: vec!["ViTModel".to_string()],
        hidden_size: 32,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 64,
        image_size: 32,
        patch_size: 8,
        num_channels: 3,
        layer_norm_eps: 1e-12,
        hidden_act: "gelu".to_string(),
        qkv_bias: true,
        id2label: None,
        label2id: None,
        extra: serde_json::Map::new(),
    }
}

/// Preprocessor matching [`tiny_vit_config`].
pub fn tiny_processor_config() -> ImageProcessorConfig {
    ImageProcessorConfig::for_image_size(tiny_vit_config().image_size)
}
