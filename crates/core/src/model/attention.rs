use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::config::VitConfig;
use crate::lora::{to_f32, LinearWithLora, LoraContext};

/// `attention.attention.{query,key,value}` + `attention.output.dense`.
pub(crate) struct VitAttention {
    pub(crate) query: LinearWithLora,
    pub(crate) key: LinearWithLora,
    pub(crate) value: LinearWithLora,
    pub(crate) output: LinearWithLora,
    num_heads: usize,
    head_dim: usize,
}

impl VitAttention {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        if cfg.num_attention_heads == 0 || hidden % cfg.num_attention_heads != 0 {
            candle_core::bail!(
                "hidden_size {hidden} is not divisible by num_attention_heads {}",
                cfg.num_attention_heads
            );
        }

        let vb_self = vb.pp("attention");
        let query = LinearWithLora::new(hidden, hidden, cfg.qkv_bias, vb_self.pp("query"))?;
        let key = LinearWithLora::new(hidden, hidden, cfg.qkv_bias, vb_self.pp("key"))?;
        let value = LinearWithLora::new(hidden, hidden, cfg.qkv_bias, vb_self.pp("value"))?;
        let output = LinearWithLora::new(hidden, hidden, true, vb.pp("output").pp("dense"))?;

        Ok(Self {
            query,
            key,
            value,
            output,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    pub fn forward(&self, xs: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        let (b_sz, seq_len, hidden) = xs.dims3()?;

        let split_heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.query.forward_with_context(xs, ctx)?)?;
        let k = split_heads(self.key.forward_with_context(xs, ctx)?)?;
        let v = split_heads(self.value.forward_with_context(xs, ctx)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?)? * scale)?;
        // Softmax in f32; the composite op keeps the graph differentiable.
        let attn_weights = candle_nn::ops::softmax(&to_f32(&attn_weights)?, D::Minus1)?;
        let attn_weights = if v.dtype() == DType::F32 {
            attn_weights
        } else {
            attn_weights.to_dtype(v.dtype())?
        };
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden))?;
        self.output.forward_with_context(&attn_output, ctx)
    }
}
