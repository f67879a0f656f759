//! T5 feed-forward sub-layer.
//!
//! Two variants exist in released checkpoints:
//! - `DenseReluDense` (t5-base): `wo(act(wi(x)))`
//! - gated (T5 v1.1, flan-t5): `wo(act(wi_0(x)) * wi_1(x))`
//!
//! Both are wrapped in a pre-norm residual block: `x + ff(layer_norm(x))`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::norm::T5LayerNorm;
use crate::config::{FeedForwardActivation, ReaderConfig};

/// SiLU (Sigmoid Linear Unit) activation function.
///
/// Also known as Swish: `silu(x) = x * sigmoid(x)`
fn silu(x: &Tensor) -> Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(x)?)
}

fn activate(act: FeedForwardActivation, x: &Tensor) -> Result<Tensor> {
    match act {
        FeedForwardActivation::Relu => x.relu(),
        FeedForwardActivation::GeluNew => x.gelu(),
        FeedForwardActivation::Silu => silu(x),
    }
}

#[derive(Debug, Clone)]
enum DenseAct {
    Plain {
        wi: Linear,
        wo: Linear,
    },
    Gated {
        wi_0: Linear,
        wi_1: Linear,
        wo: Linear,
    },
}

/// Pre-norm feed-forward block (`layer.{1|2}` of a T5 block).
#[derive(Debug, Clone)]
pub struct T5LayerFF {
    dense: DenseAct,
    act: FeedForwardActivation,
    layer_norm: T5LayerNorm,
    d_model: usize,
    d_ff: usize,
}

impl T5LayerFF {
    /// Loads the feed-forward block from a VarBuilder.
    pub fn new(cfg: &ReaderConfig, vb: VarBuilder) -> Result<Self> {
        let act = cfg
            .activation()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let layer_norm =
            T5LayerNorm::load(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?;

        let vb = vb.pp("DenseReluDense");
        let dense = if cfg.is_gated_act() {
            DenseAct::Gated {
                wi_0: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_0"))?,
                wi_1: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_1"))?,
                wo: linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("wo"))?,
            }
        } else {
            DenseAct::Plain {
                wi: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi"))?,
                wo: linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("wo"))?,
            }
        };

        Ok(Self {
            dense,
            act,
            layer_norm,
            d_model: cfg.d_model,
            d_ff: cfg.d_ff,
        })
    }

    /// Returns the model dimension.
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Returns the inner feed-forward dimension.
    pub fn d_ff(&self) -> usize {
        self.d_ff
    }

    /// Whether this block uses the gated variant.
    pub fn is_gated(&self) -> bool {
        matches!(self.dense, DenseAct::Gated { .. })
    }

    /// Applies `x + ff(layer_norm(x))` on [..., d_model].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normed = self.layer_norm.forward(x)?;
        let ys = match &self.dense {
            DenseAct::Plain { wi, wo } => {
                let hidden = activate(self.act, &wi.forward(&normed)?)?;
                wo.forward(&hidden)?
            }
            DenseAct::Gated { wi_0, wi_1, wo } => {
                let gate = activate(self.act, &wi_0.forward(&normed)?)?;
                let linear = wi_1.forward(&normed)?;
                wo.forward(&gate.mul(&linear)?)?
            }
        };
        x + ys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny_config(feed_forward_proj: &str) -> ReaderConfig {
        ReaderConfig {
            d_model: 16,
            d_ff: 32,
            feed_forward_proj: feed_forward_proj.to_string(),
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn test_silu() {
        let device = Device::Cpu;
        let x = Tensor::new(&[-1.0f32, 0.0, 1.0, 2.0], &device).unwrap();
        let values: Vec<f32> = silu(&x).unwrap().to_vec1().unwrap();

        assert!((values[0] - (-0.2689)).abs() < 0.01);
        assert!(values[1].abs() < 0.001);
        assert!((values[2] - 0.7311).abs() < 0.01);
        assert!((values[3] - 1.7616).abs() < 0.01);
    }

    #[test]
    fn test_plain_variant_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let ff = T5LayerFF::new(&tiny_config("relu"), vb).unwrap();
        assert!(!ff.is_gated());

        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device).unwrap();
        let y = ff.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_zero_weights_are_identity() {
        // With zero projections the residual path is all that remains.
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let ff = T5LayerFF::new(&tiny_config("gated-gelu"), vb).unwrap();
        assert!(ff.is_gated());

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device).unwrap();
        let y = ff.forward(&x).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_unknown_activation_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(T5LayerFF::new(&tiny_config("gated-tanh"), vb).is_err());
    }
}
