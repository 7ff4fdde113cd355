use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use super::ModelError;
use crate::lora::to_f32;

/// Linear `hidden -> num_labels` over the CLS token, computed in f32.
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    linear: Linear,
    hidden_size: usize,
    num_labels: usize,
}

impl ClassifierHead {
    /// Trainable head; `vb` is normally backed by a `VarMap`.
    pub fn new(hidden_size: usize, num_labels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (num_labels, hidden_size),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let bias = vb.get_with_hints(num_labels, "bias", Init::Const(0.0))?;
        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
            hidden_size,
            num_labels,
        })
    }

    /// Head from saved tensors (`classifier.weight`, `classifier.bias`).
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> std::result::Result<Self, ModelError> {
        let (num_labels, hidden_size) = weight.dims2().map_err(|_| ModelError::HeadShape {
            hidden_size: 0,
            num_labels: 0,
            found: weight.dims().to_vec(),
        })?;
        if bias.dims() != [num_labels] {
            return Err(ModelError::HeadShape {
                hidden_size,
                num_labels,
                found: bias.dims().to_vec(),
            });
        }
        Ok(Self {
            linear: Linear::new(to_f32(&weight)?, Some(to_f32(&bias)?)),
            hidden_size,
            num_labels,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.linear.bias()
    }

    pub fn num_parameters(&self) -> usize {
        self.num_labels * self.hidden_size + self.num_labels
    }
}

impl Module for ClassifierHead {
    /// `[B, hidden]` features to `[B, num_labels]` logits.
    fn forward(&self, features: &Tensor) -> Result<Tensor> {
        self.linear.forward(&to_f32(features)?)
    }
}
