//! ViT image classifier with per-task LoRA adapters.
//!
//! [`VitBackbone`] mirrors the HF `ViTModel` weight layout. Every linear in the
//! encoder is a [`LinearWithLora`], so adapters can be attached to whichever
//! modules a [`LoraConfig`] targets and are picked per forward pass through a
//! [`LoraContext`].

mod attention;
mod builder;
mod config;
mod head;
mod mlp;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use thiserror::Error;

use crate::lora::{to_f32, LinearWithLora, LoraAdapter, LoraConfig, LoraConfigError, LoraContext, LoraModel};

use self::attention::VitAttention;
use self::mlp::VitMlp;

pub use builder::{AdapterModelBuilder, LoraImageClassifier, ParameterCount, Precision};
pub use config::VitConfig;
pub use head::ClassifierHead;

/// Module path of the encoder inside the image-classification model.
pub const ENCODER_PREFIX: &str = "vit";

/// Errors from building or adapting models.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("invalid LoRA config: {0}")]
    Lora(#[from] LoraConfigError),
    #[error("no module matches target_modules {0:?}")]
    NoTargetModules(Vec<String>),
    #[error("adapter targets unknown module {0}")]
    UnknownModule(String),
    #[error("adapter for {module} is {found:?} (in, out), layer is {expected:?}")]
    AdapterShape {
        module: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("classifier head {found:?} does not fit hidden size {hidden_size} and {num_labels} labels")]
    HeadShape {
        hidden_size: usize,
        num_labels: usize,
        found: Vec<usize>,
    },
    #[error("at least one label is required")]
    NoLabels,
}

// ─── Layer Norm ───────────────────────────────────────────────────────────

/// Layer norm computed in f32 from primitive ops so gradients flow through it.
struct VitLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl VitLayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: to_f32(&vb.get(size, "weight")?)?,
            bias: to_f32(&vb.get(size, "bias")?)?,
            eps,
        })
    }
}

impl Module for VitLayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = to_f32(xs)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let out = normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        if dtype == DType::F32 {
            Ok(out)
        } else {
            out.to_dtype(dtype)
        }
    }
}

// ─── Embeddings ───────────────────────────────────────────────────────────

struct VitEmbeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_embeddings: Conv2d,
    image_size: usize,
}

impl VitEmbeddings {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let cls_token = vb.get((1, 1, hidden), "cls_token")?;
        let position_embeddings = vb.get((1, cfg.seq_len(), hidden), "position_embeddings")?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embeddings = conv2d(
            cfg.num_channels,
            hidden,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embeddings").pp("projection"),
        )?;
        Ok(Self {
            cls_token,
            position_embeddings,
            patch_embeddings,
            image_size: cfg.image_size,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b_sz, _c, h, w) = pixel_values.dims4()?;
        if h != self.image_size || w != self.image_size {
            candle_core::bail!(
                "expected {0}x{0} pixel values, got {h}x{w}",
                self.image_size
            );
        }

        // [B, hidden, grid, grid] -> [B, patches, hidden]
        let patches = self
            .patch_embeddings
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let hidden = patches.dim(2)?;
        let cls = self.cls_token.broadcast_as((b_sz, 1, hidden))?.contiguous()?;
        Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.position_embeddings)
    }
}

// ─── Encoder ──────────────────────────────────────────────────────────────

struct VitLayer {
    layernorm_before: VitLayerNorm,
    attention: VitAttention,
    layernorm_after: VitLayerNorm,
    mlp: VitMlp,
}

impl VitLayer {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            layernorm_before: VitLayerNorm::new(cfg.hidden_size, eps, vb.pp("layernorm_before"))?,
            attention: VitAttention::new(cfg, vb.pp("attention"))?,
            layernorm_after: VitLayerNorm::new(cfg.hidden_size, eps, vb.pp("layernorm_after"))?,
            mlp: VitMlp::new(cfg, vb.clone())?,
        })
    }

    fn forward(&self, xs: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        let residual = xs;
        let xs = self.layernorm_before.forward(xs)?;
        let xs = (self.attention.forward(&xs, ctx)? + residual)?;
        let residual = &xs;
        let out = self.mlp.forward(&self.layernorm_after.forward(&xs)?, ctx)?;
        out + residual
    }

    fn linears(&self) -> [(&'static str, &LinearWithLora); 6] {
        [
            ("attention.attention.query", &self.attention.query),
            ("attention.attention.key", &self.attention.key),
            ("attention.attention.value", &self.attention.value),
            ("attention.output.dense", &self.attention.output),
            ("intermediate.dense", &self.mlp.intermediate),
            ("output.dense", &self.mlp.output),
        ]
    }

    fn linears_mut(&mut self) -> [(&'static str, &mut LinearWithLora); 6] {
        let VitAttention {
            query,
            key,
            value,
            output,
            ..
        } = &mut self.attention;
        let VitMlp {
            intermediate,
            output: mlp_output,
            ..
        } = &mut self.mlp;
        [
            ("attention.attention.query", query),
            ("attention.attention.key", key),
            ("attention.attention.value", value),
            ("attention.output.dense", output),
            ("intermediate.dense", intermediate),
            ("output.dense", mlp_output),
        ]
    }
}

/// A linear layer an adapter can attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetModule {
    /// Full module path, e.g. `vit.encoder.layer.0.attention.attention.query`.
    pub path: String,
    pub in_features: usize,
    pub out_features: usize,
}

/// Frozen ViT encoder shared by every task adapter.
pub struct VitBackbone {
    embeddings: VitEmbeddings,
    layers: Vec<VitLayer>,
    layernorm: VitLayerNorm,
    config: VitConfig,
    device: Device,
    dtype: DType,
}

impl VitBackbone {
    /// Load from a checkpoint laid out like `ViTModel` or `ViTForImageClassification`.
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let vb = if vb.contains_tensor(&format!("{ENCODER_PREFIX}.embeddings.cls_token")) {
            vb.pp(ENCODER_PREFIX)
        } else {
            vb
        };

        let embeddings = VitEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_l = vb.pp("encoder").pp("layer");
        for i in 0..cfg.num_hidden_layers {
            layers.push(VitLayer::new(cfg, vb_l.pp(i))?);
        }
        let layernorm = VitLayerNorm::new(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layernorm"))?;

        Ok(Self {
            embeddings,
            layers,
            layernorm,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dtype of the frozen weights.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Final hidden states `[B, seq, hidden]` in the backbone dtype.
    pub fn forward(&self, pixel_values: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        let pixel_values = if pixel_values.dtype() == self.dtype {
            pixel_values.clone()
        } else {
            pixel_values.to_dtype(self.dtype)?
        };

        let mut xs = self.embeddings.forward(&pixel_values)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, ctx)?;
        }
        self.layernorm.forward(&xs)
    }

    /// CLS-token features `[B, hidden]` in f32.
    pub fn cls_features(&self, pixel_values: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        let hidden = self.forward(pixel_values, ctx)?;
        to_f32(&hidden.narrow(1, 0, 1)?.squeeze(1)?)
    }

    fn module_path(layer: usize, name: &str) -> String {
        format!("{ENCODER_PREFIX}.encoder.layer.{layer}.{name}")
    }

    /// Every adaptable linear with its dimensions, in layer order.
    pub fn modules(&self) -> Vec<TargetModule> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer.linears().map(|(name, linear)| {
                    let (in_features, out_features) = linear.dims();
                    TargetModule {
                        path: Self::module_path(i, name),
                        in_features,
                        out_features,
                    }
                })
            })
            .collect()
    }

    /// The modules `config` puts adapters on.
    pub fn target_modules(&self, config: &LoraConfig) -> Vec<TargetModule> {
        self.modules()
            .into_iter()
            .filter(|m| config.matches_target(&m.path))
            .collect()
    }

    /// Register one module's adapter under `adapter_name`.
    pub fn register_module_adapter(
        &mut self,
        adapter_name: &str,
        module_path: &str,
        adapter: LoraAdapter,
    ) -> std::result::Result<(), ModelError> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (name, linear) in layer.linears_mut() {
                if Self::module_path(i, name) != module_path {
                    continue;
                }
                let expected = linear.dims();
                let found = (adapter.input_dim(), adapter.output_dim());
                if expected != found {
                    return Err(ModelError::AdapterShape {
                        module: module_path.to_string(),
                        expected,
                        found,
                    });
                }
                linear.register_adapter(adapter_name, adapter);
                return Ok(());
            }
        }
        Err(ModelError::UnknownModule(module_path.to_string()))
    }

    /// Register every module adapter of a loaded task adapter under its name.
    ///
    /// Returns the number of adapted modules. Nothing is registered when any
    /// module is unknown or mis-shaped.
    pub fn register_lora(&mut self, model: &LoraModel) -> std::result::Result<usize, ModelError> {
        let known = self.modules();
        for (path, adapter) in &model.adapters {
            let module = known
                .iter()
                .find(|m| &m.path == path)
                .ok_or_else(|| ModelError::UnknownModule(path.clone()))?;
            let found = (adapter.input_dim(), adapter.output_dim());
            if found != (module.in_features, module.out_features) {
                return Err(ModelError::AdapterShape {
                    module: path.clone(),
                    expected: (module.in_features, module.out_features),
                    found,
                });
            }
        }

        for (path, adapter) in &model.adapters {
            self.register_module_adapter(&model.name, path, adapter.clone())?;
        }
        Ok(model.adapters.len())
    }

    /// Unregister an adapter everywhere. Returns the number of modules it was on.
    pub fn remove_lora(&mut self, adapter_name: &str) -> usize {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.linears_mut())
            .filter_map(|(_, linear)| linear.remove_adapter(adapter_name))
            .count()
    }

    /// Whether any module carries `adapter_name`.
    pub fn has_lora(&self, adapter_name: &str) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.linears().iter().any(|(_, l)| l.has_adapter(adapter_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_backbone_varbuilder, tiny_vit_config};

    fn abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
    }

    fn pixels(cfg: &VitConfig) -> Tensor {
        Tensor::randn(0f32, 1.0, (2, 3, cfg.image_size, cfg.image_size), &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_shapes() {
        let cfg = tiny_vit_config();
        let backbone = VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F32)).unwrap();
        let hidden = backbone.forward(&pixels(&cfg), &LoraContext::none()).unwrap();
        assert_eq!(hidden.dims(), &[2, cfg.seq_len(), cfg.hidden_size]);

        let cls = backbone.cls_features(&pixels(&cfg), &LoraContext::none()).unwrap();
        assert_eq!(cls.dims(), &[2, cfg.hidden_size]);
        assert_eq!(cls.dtype(), DType::F32);
    }

    #[test]
    fn rejects_wrong_image_size() {
        let cfg = tiny_vit_config();
        let backbone = VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F32)).unwrap();
        let bad = Tensor::zeros((1, 3, cfg.image_size * 2, cfg.image_size * 2), DType::F32, &Device::Cpu)
            .unwrap();
        assert!(backbone.forward(&bad, &LoraContext::none()).is_err());
    }

    #[test]
    fn target_modules_follow_config() {
        let cfg = tiny_vit_config();
        let backbone = VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F32)).unwrap();
        assert_eq!(backbone.modules().len(), 6 * cfg.num_hidden_layers);

        let targets = backbone.target_modules(&LoraConfig::default());
        assert_eq!(targets.len(), 2 * cfg.num_hidden_layers);
        assert_eq!(targets[0].path, "vit.encoder.layer.0.attention.attention.query");
        assert_eq!(targets[1].path, "vit.encoder.layer.0.attention.attention.value");
        assert_eq!(targets[0].in_features, cfg.hidden_size);
    }

    #[test]
    fn adapters_are_selected_by_context() {
        let cfg = tiny_vit_config();
        let mut backbone =
            VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F32)).unwrap();
        let h = cfg.hidden_size;

        let mut model = LoraModel::new("model1", 1, 2, 2.0);
        for target in backbone.target_modules(&LoraConfig::default()) {
            let a = Tensor::randn(0f32, 0.5, (2, h), &Device::Cpu).unwrap();
            let b = Tensor::randn(0f32, 0.5, (h, 2), &Device::Cpu).unwrap();
            model.add_adapter(target.path, LoraAdapter::new(a, b, 2, 2.0));
        }
        assert_eq!(backbone.register_lora(&model).unwrap(), 2 * cfg.num_hidden_layers);
        assert!(backbone.has_lora("model1"));

        let px = pixels(&cfg);
        let base = backbone.cls_features(&px, &LoraContext::none()).unwrap();
        let adapted = backbone.cls_features(&px, &LoraContext::with_adapter("model1")).unwrap();
        assert!(abs_diff(&base, &adapted) > 0.0);

        assert_eq!(backbone.remove_lora("model1"), 2 * cfg.num_hidden_layers);
        assert!(!backbone.has_lora("model1"));
    }

    #[test]
    fn register_rejects_unknown_or_misshaped_modules() {
        let cfg = tiny_vit_config();
        let mut backbone =
            VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F32)).unwrap();

        let mut unknown = LoraModel::new("bad", 1, 2, 2.0);
        unknown.add_adapter(
            "vit.encoder.layer.99.attention.attention.query",
            LoraAdapter::new(
                Tensor::zeros((2, cfg.hidden_size), DType::F32, &Device::Cpu).unwrap(),
                Tensor::zeros((cfg.hidden_size, 2), DType::F32, &Device::Cpu).unwrap(),
                2,
                2.0,
            ),
        );
        assert!(matches!(
            backbone.register_lora(&unknown),
            Err(ModelError::UnknownModule(_))
        ));

        let mut misshaped = LoraModel::new("bad", 1, 2, 2.0);
        misshaped.add_adapter(
            "vit.encoder.layer.0.attention.attention.query",
            LoraAdapter::new(
                Tensor::zeros((2, 7), DType::F32, &Device::Cpu).unwrap(),
                Tensor::zeros((cfg.hidden_size, 2), DType::F32, &Device::Cpu).unwrap(),
                2,
                2.0,
            ),
        );
        assert!(matches!(
            backbone.register_lora(&misshaped),
            Err(ModelError::AdapterShape { .. })
        ));
        assert!(!backbone.has_lora("bad"));
    }

    #[test]
    fn half_precision_backbone_forward() {
        let cfg = tiny_vit_config();
        let backbone = VitBackbone::new(&cfg, tiny_backbone_varbuilder(&cfg, DType::F16)).unwrap();
        assert_eq!(backbone.dtype(), DType::F16);
        let cls = backbone.cls_features(&pixels(&cfg), &LoraContext::none()).unwrap();
        assert_eq!(cls.dtype(), DType::F32);
    }
}
