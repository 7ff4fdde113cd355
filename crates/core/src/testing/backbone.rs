use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::tiny_config::tiny_processor_config;
use crate::hub::{self, BackboneFiles};
use crate::model::VitConfig;

fn uniform(rng: &mut StdRng, shape: &[usize], bound: f32) -> candle_core::Result<Tensor> {
    let dist = Uniform::new_inclusive(-bound, bound);
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| dist.sample(rng)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)
}

/// Deterministic random `ViTModel` weights for `cfg`, keyed like an HF checkpoint.
pub fn tiny_backbone_tensors(cfg: &VitConfig) -> candle_core::Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let h = cfg.hidden_size;
    let i = cfg.intermediate_size;
    let p = cfg.patch_size;
    let mut t = HashMap::new();

    let patch_fan_in = cfg.num_channels * p * p;
    t.insert("embeddings.cls_token".to_string(), uniform(&mut rng, &[1, 1, h], 0.02)?);
    t.insert(
        "embeddings.position_embeddings".to_string(),
        uniform(&mut rng, &[1, cfg.seq_len(), h], 0.02)?,
    );
    t.insert(
        "embeddings.patch_embeddings.projection.weight".to_string(),
        uniform(&mut rng, &[h, cfg.num_channels, p, p], 1.0 / (patch_fan_in as f32).sqrt())?,
    );
    t.insert(
        "embeddings.patch_embeddings.projection.bias".to_string(),
        Tensor::zeros(h, DType::F32, &Device::Cpu)?,
    );

    let mut linear = |t: &mut HashMap<String, Tensor>,
                      name: String,
                      out_f: usize,
                      in_f: usize|
     -> candle_core::Result<()> {
        let bound = 1.0 / (in_f as f32).sqrt();
        let w = uniform(&mut rng, &[out_f, in_f], bound)?;
        let b = uniform(&mut rng, &[out_f], bound)?;
        t.insert(format!("{name}.weight"), w);
        t.insert(format!("{name}.bias"), b);
        Ok(())
    };

    for layer in 0..cfg.num_hidden_layers {
        let prefix = format!("encoder.layer.{layer}");
        for proj in ["query", "key", "value"] {
            linear(&mut t, format!("{prefix}.attention.attention.{proj}"), h, h)?;
        }
        linear(&mut t, format!("{prefix}.attention.output.dense"), h, h)?;
        linear(&mut t, format!("{prefix}.intermediate.dense"), i, h)?;
        linear(&mut t, format!("{prefix}.output.dense"), h, i)?;
        for norm in ["layernorm_before", "layernorm_after"] {
            t.insert(format!("{prefix}.{norm}.weight"), Tensor::ones(h, DType::F32, &Device::Cpu)?);
            t.insert(format!("{prefix}.{norm}.bias"), Tensor::zeros(h, DType::F32, &Device::Cpu)?);
        }
    }

    t.insert("layernorm.weight".to_string(), Tensor::ones(h, DType::F32, &Device::Cpu)?);
    t.insert("layernorm.bias".to_string(), Tensor::zeros(h, DType::F32, &Device::Cpu)?);
    Ok(t)
}

/// In-memory VarBuilder over [`tiny_backbone_tensors`].
pub fn tiny_backbone_varbuilder(cfg: &VitConfig, dtype: DType) -> VarBuilder<'static> {
    match tiny_backbone_tensors(cfg) {
        Ok(tensors) => VarBuilder::from_tensors(tensors, dtype, &Device::Cpu),
        Err(e) => panic!("failed to build tiny backbone: {e}"),
    }
}

/// Write a tiny backbone snapshot (`config.json`, `preprocessor_config.json`,
/// `model.safetensors`) into `dir` and open it like a downloaded model.
pub fn write_tiny_backbone(dir: impl AsRef<Path>) -> anyhow::Result<BackboneFiles> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let cfg = super::tiny_vit_config();

    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&cfg)?)?;
    std::fs::write(
        dir.join("preprocessor_config.json"),
        serde_json::to_string_pretty(&tiny_processor_config())?,
    )?;
    candle_core::safetensors::save(&tiny_backbone_tensors(&cfg)?, dir.join("model.safetensors"))?;

    hub::open_local_backbone(dir)
}
