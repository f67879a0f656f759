//! T5 layer normalization.
//!
//! T5 uses a scale-only normalization: inputs are divided by their root mean
//! square, with no mean subtraction and no bias. The variance is always
//! accumulated in f32, even for half-precision weights.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Scale-only layer normalization used by every T5 sub-layer.
///
/// Formula: `output = x / sqrt(mean(x^2) + eps) * weight`
#[derive(Debug, Clone)]
pub struct T5LayerNorm {
    /// Learnable scale parameter [d_model].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl T5LayerNorm {
    /// Creates a layer norm from an existing weight tensor.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Loads the `weight` parameter from a VarBuilder.
    ///
    /// Freshly initialized (VarMap-backed) builders get a weight of ones.
    pub fn load(d_model: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(d_model, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Creates a layer norm with a weight of ones.
    pub fn new_ones(d_model: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(d_model, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Returns a reference to the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Normalizes the last dimension of `x` ([..., d_model]).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = x_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normalized.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_load_initializes_ones() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = T5LayerNorm::load(8, 1e-6, vb.pp("layer_norm")).unwrap();

        let weight: Vec<f32> = norm.weight().to_vec1().unwrap();
        assert_eq!(weight, vec![1.0; 8]);
    }

    #[test]
    fn test_no_mean_subtraction() {
        let device = Device::Cpu;
        let norm = T5LayerNorm::new_ones(2, 0.0, DType::F32, &device).unwrap();

        // A constant row keeps its sign: LayerNorm would map it to zeros.
        let x = Tensor::new(&[[3.0f32, 3.0]], &device).unwrap();
        let out: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        assert!((out[0][0] - 1.0).abs() < 1e-6);
        assert!((out[0][1] - 1.0).abs() < 1e-6);
    }
}
