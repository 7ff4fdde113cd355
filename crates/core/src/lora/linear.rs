//! Frozen linear layer carrying any number of named LoRA adapters.

use std::collections::HashMap;

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};

use super::context::LoraContext;
use super::types::LoraAdapter;

/// A frozen `Linear` plus named adapters:
/// ```text
/// output = base_linear(x) + scale * (dropout(x) @ lora_a.T @ lora_b.T)
/// ```
///
/// The adapter is selected per forward pass by the [`LoraContext`]. The
/// adapter path runs in the adapter's dtype (f32 for trained adapters) and the
/// result is cast back to the base layer's dtype, so a half-precision base
/// stays frozen in half precision.
pub struct LinearWithLora {
    base: Linear,
    adapters: HashMap<String, LoraAdapter>,
}

impl LinearWithLora {
    /// Wrap a frozen layer; no adapters yet.
    pub fn from_linear(base: Linear) -> Self {
        Self {
            base,
            adapters: HashMap::new(),
        }
    }

    /// Load the base layer from a VarBuilder.
    pub fn new(in_features: usize, out_features: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let base = if bias {
            linear(in_features, out_features, vb)?
        } else {
            linear_no_bias(in_features, out_features, vb)?
        };
        Ok(Self::from_linear(base))
    }

    /// Add (or replace) the adapter selected by `name`.
    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn remove_adapter(&mut self, name: &str) -> Option<LoraAdapter> {
        self.adapters.remove(name)
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// `(in_features, out_features)` of the base layer.
    pub fn dims(&self) -> (usize, usize) {
        let (out_features, in_features) = self.base.weight().dims2().unwrap_or((0, 0));
        (in_features, out_features)
    }

    /// Eval-mode forward through `adapter_name`; unknown names fall back to
    /// the base output.
    pub fn forward_with_lora(&self, x: &Tensor, adapter_name: Option<&str>) -> Result<Tensor> {
        self.forward_ctx(x, adapter_name, false)
    }

    /// Forward pass driven by a [`LoraContext`].
    pub fn forward_with_context(&self, x: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        self.forward_ctx(x, ctx.adapter_name(), ctx.is_training())
    }

    fn forward_ctx(&self, x: &Tensor, adapter_name: Option<&str>, train: bool) -> Result<Tensor> {
        let output = self.base.forward(x)?;

        if let Some(adapter) = adapter_name.and_then(|name| self.adapters.get(name)) {
            let lora_output = apply_lora(x, adapter, train)?;
            return output.add(&lora_output.to_dtype(output.dtype())?);
        }

        Ok(output)
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn weight(&self) -> &Tensor {
        self.base.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.base.bias()
    }
}

/// `scale * (dropout(x) @ lora_a.T @ lora_b.T)` in the adapter's dtype.
fn apply_lora(x: &Tensor, adapter: &LoraAdapter, train: bool) -> Result<Tensor> {
    let x_dims = x.dims().to_vec();
    let features = x_dims.last().copied().unwrap_or(0);
    let rows: usize = x_dims.iter().rev().skip(1).product();

    // [..., in] -> [rows, in]
    let mut x_2d = x.reshape((rows, features))?;
    let adapter_dtype = adapter.lora_a.dtype();
    if x_2d.dtype() != adapter_dtype {
        x_2d = x_2d.to_dtype(adapter_dtype)?;
    }
    if train && adapter.dropout > 0.0 {
        x_2d = candle_nn::ops::dropout(&x_2d, adapter.dropout)?;
    }

    let intermediate = x_2d.matmul(&adapter.lora_a.t()?)?;
    let lora_output = intermediate.matmul(&adapter.lora_b.t()?)?;

    let scaled = if (adapter.scale - 1.0).abs() > f32::EPSILON {
        lora_output.affine(adapter.scale as f64, 0.0)?
    } else {
        lora_output
    };

    let mut out_dims = x_dims;
    if let Some(last) = out_dims.last_mut() {
        *last = adapter.output_dim();
    }
    scaled.reshape(out_dims)
}

impl Module for LinearWithLora {
    /// Base forward pass (no LoRA).
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.base.forward(x)
    }
}

/// Cast to f32 unless already f32.
pub(crate) fn to_f32(x: &Tensor) -> Result<Tensor> {
    if x.dtype() == DType::F32 {
        Ok(x.clone())
    } else {
        x.to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn create_test_linear(in_features: usize, out_features: usize, device: &Device) -> LinearWithLora {
        let vb = VarBuilder::zeros(DType::F32, device);
        LinearWithLora::new(in_features, out_features, true, vb).unwrap()
    }

    fn random_adapter(rank: usize, in_features: usize, out_features: usize, std: f32) -> LoraAdapter {
        let device = Device::Cpu;
        let lora_a = Tensor::randn(0.0f32, std, (rank, in_features), &device).unwrap();
        let lora_b = Tensor::randn(0.0f32, std, (out_features, rank), &device).unwrap();
        LoraAdapter::new(lora_a, lora_b, rank, 16.0)
    }

    fn abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_linear_with_lora_no_adapter() {
        let device = Device::Cpu;
        let layer = create_test_linear(64, 32, &device);
        assert_eq!(layer.dims(), (64, 32));

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let output = layer.forward_with_lora(&x, None).unwrap();
        assert_eq!(output.dims(), &[2, 8, 32]);
    }

    #[test]
    fn test_adapter_changes_output_only_when_selected() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        layer.register_adapter("model1", random_adapter(8, 64, 32, 0.1));
        assert!(layer.has_adapter("model1"));

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let with_lora = layer.forward_with_lora(&x, Some("model1")).unwrap();
        let without = layer.forward_with_lora(&x, None).unwrap();
        let unknown = layer.forward_with_lora(&x, Some("missing")).unwrap();

        assert!(abs_diff(&with_lora, &without) > 0.0);
        assert!(abs_diff(&unknown, &without) < f32::EPSILON);
    }

    #[test]
    fn test_multiple_adapters_are_independent() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        layer.register_adapter("model1", random_adapter(8, 64, 32, 0.1));
        layer.register_adapter("model2", random_adapter(8, 64, 32, 0.2));

        let mut names = layer.adapter_names();
        names.sort();
        assert_eq!(names, vec!["model1", "model2"]);

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let out1 = layer.forward_with_lora(&x, Some("model1")).unwrap();
        let out2 = layer.forward_with_lora(&x, Some("model2")).unwrap();
        assert!(abs_diff(&out1, &out2) > 0.0);

        assert!(layer.remove_adapter("model1").is_some());
        assert_eq!(layer.num_adapters(), 1);
    }

    #[test]
    fn test_linear_with_lora_scale() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(16, 8, &device);

        // scale = alpha / rank = 8 / 4 = 2
        let lora_a = Tensor::ones((4, 16), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((8, 4), DType::F32, &device).unwrap();
        layer.register_adapter("scaled", LoraAdapter::new(lora_a, lora_b, 4, 8.0));

        // ones @ A.T = 16 per rank, @ B.T = 64, * 2 = 128
        let x = Tensor::ones((1, 1, 16), DType::F32, &device).unwrap();
        let output = layer.forward_with_lora(&x, Some("scaled")).unwrap();
        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        assert!(output_vec.iter().all(|&v| (v - 128.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_half_precision_base_with_f32_adapter() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F16, &device);
        let mut layer = LinearWithLora::new(16, 8, true, vb).unwrap();

        let lora_a = Tensor::ones((4, 16), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((8, 4), DType::F32, &device).unwrap();
        layer.register_adapter("half", LoraAdapter::new(lora_a, lora_b, 4, 4.0));

        let x = Tensor::ones((2, 3, 16), DType::F16, &device).unwrap();
        let output = layer.forward_with_lora(&x, Some("half")).unwrap();
        assert_eq!(output.dtype(), DType::F16);
        assert_eq!(output.dims(), &[2, 3, 8]);
        let values: Vec<f32> = to_f32(&output).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 64.0).abs() < 1e-2));
    }

    #[test]
    fn test_dropout_only_in_training() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(32, 16, &device);
        let adapter = random_adapter(4, 32, 16, 0.5).with_dropout(0.5);
        layer.register_adapter("model1", adapter);

        let x = Tensor::randn(0.0f32, 1.0, (4, 32), &device).unwrap();
        let eval_a = layer
            .forward_with_context(&x, &LoraContext::with_adapter("model1"))
            .unwrap();
        let eval_b = layer
            .forward_with_context(&x, &LoraContext::with_adapter("model1"))
            .unwrap();
        assert!(abs_diff(&eval_a, &eval_b) < f32::EPSILON);

        let train = layer
            .forward_with_context(&x, &LoraContext::training("model1"))
            .unwrap();
        assert_eq!(train.dims(), &[4, 16]);
    }

    #[test]
    fn test_module_trait_ignores_adapters() {
        let device = Device::Cpu;
        let mut layer = create_test_linear(64, 32, &device);
        layer.register_adapter("model1", random_adapter(8, 64, 32, 0.1));

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let base = layer.forward(&x).unwrap();
        let none = layer.forward_with_lora(&x, None).unwrap();
        assert!(abs_diff(&base, &none) < f32::EPSILON);
    }
}
