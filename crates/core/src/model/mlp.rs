use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::config::VitConfig;
use crate::lora::{LinearWithLora, LoraContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HiddenAct {
    Gelu,
    GeluTanh,
    Relu,
}

impl HiddenAct {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(Self::GeluTanh),
            "relu" => Ok(Self::Relu),
            other => candle_core::bail!("unsupported hidden_act {other:?}"),
        }
    }

    fn apply(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::GeluTanh => xs.gelu(),
            Self::Relu => xs.relu(),
        }
    }
}

/// `intermediate.dense` -> activation -> `output.dense`.
pub(crate) struct VitMlp {
    pub(crate) intermediate: LinearWithLora,
    pub(crate) output: LinearWithLora,
    act: HiddenAct,
}

impl VitMlp {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let inter = cfg.intermediate_size;
        let intermediate = LinearWithLora::new(hidden, inter, true, vb.pp("intermediate").pp("dense"))?;
        let output = LinearWithLora::new(inter, hidden, true, vb.pp("output").pp("dense"))?;
        Ok(Self {
            intermediate,
            output,
            act: HiddenAct::from_name(&cfg.hidden_act)?,
        })
    }

    pub fn forward(&self, xs: &Tensor, ctx: &LoraContext) -> Result<Tensor> {
        let xs = self.intermediate.forward_with_context(xs, ctx)?;
        let xs = self.act.apply(&xs)?;
        self.output.forward_with_context(&xs, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_activation_names() {
        assert_eq!(HiddenAct::from_name("gelu").unwrap(), HiddenAct::Gelu);
        assert_eq!(HiddenAct::from_name("gelu_pytorch_tanh").unwrap(), HiddenAct::GeluTanh);
        assert!(HiddenAct::from_name("swish").is_err());
    }
}
