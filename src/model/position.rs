//! Position encodings used by the FiD reader.
//!
//! Two unrelated mechanisms live here:
//! - T5 relative position bias: a learned per-head scalar added to attention
//!   scores, indexed by a log-bucketed query/key distance.
//! - Passage position embedding: a fixed sinusoid per passage index, added to
//!   the fused encoder output so the decoder can tell passages apart.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

/// Maps a relative position (`key_pos - query_pos`) to a T5 bucket index.
///
/// Half of the buckets are exact distances, the other half cover
/// logarithmically larger ranges up to `max_distance`. Bidirectional
/// attention splits the buckets between past and future positions; causal
/// attention only distinguishes past positions.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> u32 {
    let mut num_buckets = num_buckets as i64;
    let mut bucket = 0i64;
    let distance = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            bucket += num_buckets;
        }
        relative_position.abs()
    } else {
        -relative_position.min(0)
    };

    let max_exact = num_buckets / 2;
    if distance < max_exact {
        bucket += distance;
    } else {
        let scaled = (distance as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64;
        let large = max_exact + scaled as i64;
        bucket += large.min(num_buckets - 1);
    }
    bucket as u32
}

/// Learned relative position bias (`relative_attention_bias`).
///
/// Only the first block of each T5 stack owns one; its output is shared by
/// every later block of the stack.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    /// Bias table [num_buckets, num_heads].
    table: Embedding,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
}

impl RelativePositionBias {
    /// Loads the bias table.
    ///
    /// # Arguments
    ///
    /// * `num_buckets` - Number of distance buckets
    /// * `max_distance` - Distance at which buckets saturate
    /// * `num_heads` - Number of attention heads
    /// * `bidirectional` - `true` for the encoder, `false` for the causal decoder
    /// * `vb` - VarBuilder pointing at `relative_attention_bias`
    pub fn new(
        num_buckets: usize,
        max_distance: usize,
        num_heads: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = embedding(num_buckets, num_heads, vb)?;
        Ok(Self {
            table,
            bidirectional,
            num_buckets,
            max_distance,
        })
    }

    /// Computes the bias for `query_len` queries against `key_len` keys.
    ///
    /// Queries sit at positions `key_len - query_len ..key_len`, which covers
    /// both full-sequence passes and cached single-step decoding.
    ///
    /// # Returns
    ///
    /// Bias tensor [1, num_heads, query_len, key_len]
    pub fn forward(&self, query_len: usize, key_len: usize, device: &Device) -> Result<Tensor> {
        let offset = key_len.saturating_sub(query_len) as i64;
        let buckets: Vec<u32> = (0..query_len as i64)
            .flat_map(|q| {
                let query_pos = offset + q;
                (0..key_len as i64).map(move |key_pos| {
                    relative_position_bucket(
                        key_pos - query_pos,
                        self.bidirectional,
                        self.num_buckets,
                        self.max_distance,
                    )
                })
            })
            .collect();
        let buckets = Tensor::from_vec(buckets, (query_len, key_len), device)?;

        // [q, k, heads] -> [1, heads, q, k]
        self.table
            .forward(&buckets)?
            .permute((2, 0, 1))?
            .unsqueeze(0)
    }
}

/// Sinusoidal embedding of a single position.
///
/// Element `j` is `sin(position / 10000^(2*(j/2)/dim))` for even `j` and the
/// cosine of the same angle for odd `j`.
pub fn sinusoid(position: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|j| {
            let exponent = 2.0 * (j / 2) as f64 / dim as f64;
            let angle = position as f64 / 10000f64.powf(exponent);
            if j % 2 == 0 {
                angle.sin() as f32
            } else {
                angle.cos() as f32
            }
        })
        .collect()
}

/// Fixed per-passage embedding added to the fused encoder output.
#[derive(Debug, Clone)]
pub struct PassagePositionEmbedding {
    dim: usize,
}

impl PassagePositionEmbedding {
    /// Creates the embedding for a model dimension of `dim`.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Returns the embedding dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Builds the embedding for one example's fused sequence.
    ///
    /// Every token of passage `i` receives `sinusoid(i, dim)`.
    ///
    /// # Returns
    ///
    /// Tensor [n_passages * passage_length, dim]
    pub fn forward(
        &self,
        n_passages: usize,
        passage_length: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let table: Vec<f32> = (0..n_passages)
            .flat_map(|i| sinusoid(i, self.dim))
            .collect();
        Tensor::from_vec(table, (n_passages, 1, self.dim), device)?
            .broadcast_as((n_passages, passage_length, self.dim))?
            .reshape((n_passages * passage_length, self.dim))?
            .to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_exact_range() {
        // Bidirectional, 32 buckets: 16 per direction, 8 exact.
        assert_eq!(relative_position_bucket(0, true, 32, 128), 0);
        assert_eq!(relative_position_bucket(-3, true, 32, 128), 3);
        assert_eq!(relative_position_bucket(3, true, 32, 128), 16 + 3);
    }

    #[test]
    fn test_bucket_saturates() {
        assert_eq!(relative_position_bucket(-1000, true, 32, 128), 15);
        assert_eq!(relative_position_bucket(1000, true, 32, 128), 31);
        assert_eq!(relative_position_bucket(-1000, false, 32, 128), 31);
    }

    #[test]
    fn test_causal_bucket_ignores_future() {
        assert_eq!(relative_position_bucket(5, false, 32, 128), 0);
        assert_eq!(relative_position_bucket(-5, false, 32, 128), 5);
    }

    #[test]
    fn test_sinusoid_position_zero() {
        let pe = sinusoid(0, 6);
        assert_eq!(pe, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_passage_embedding_repeats_per_token() {
        let device = Device::Cpu;
        let pe = PassagePositionEmbedding::new(4);
        let out = pe.forward(2, 3, DType::F32, &device).unwrap();
        assert_eq!(out.dims(), &[6, 4]);

        let rows: Vec<Vec<f32>> = out.to_vec2().unwrap();
        assert_eq!(rows[0], rows[2]);
        assert_eq!(rows[3], rows[5]);
        assert_eq!(rows[3], sinusoid(1, 4));
    }
}
