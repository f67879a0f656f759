//! T5 attention implementation.
//!
//! One type serves the three attention sites of a T5 model:
//! - encoder self-attention (bidirectional, padding mask)
//! - decoder self-attention (causal, KV cache for incremental decoding)
//! - decoder cross-attention over the fused encoder output
//!
//! Cross-attention layers can additionally keep the raw scores of the first
//! decoded token. FiD aggregates them into per-passage relevance scores
//! (see [`super::scores`]).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::position::RelativePositionBias;
use crate::config::ReaderConfig;

/// Converts a 0/1 padding mask into an additive attention bias.
///
/// # Arguments
///
/// * `mask` - Mask [batch, key_len], 1 for real tokens, 0 for padding
/// * `dtype` - Dtype of the attention scores
///
/// # Returns
///
/// Bias [batch, 1, 1, key_len]: 0 where attended, the dtype minimum elsewhere.
pub fn padding_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch_size, key_len) = mask.dims2()?;
    let blocked = mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    (blocked * f32::MIN as f64)?
        .reshape((batch_size, 1, 1, key_len))?
        .to_dtype(dtype)
}

/// Creates a causal attention bias.
///
/// Queries occupy the last `query_len` positions of the `key_len` keys, so a
/// single cached decode step may attend to every key.
///
/// # Returns
///
/// Bias [1, 1, query_len, key_len]
pub fn causal_bias(
    query_len: usize,
    key_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let offset = key_len.saturating_sub(query_len);
    let bias: Vec<f32> = (0..query_len)
        .flat_map(|i| {
            let query_pos = offset + i;
            (0..key_len).map(move |key_pos| if key_pos > query_pos { f32::MIN } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(bias, (1, 1, query_len, key_len), device)?.to_dtype(dtype)
}

/// T5 multi-head attention.
///
/// Unlike most transformers, T5 does not scale `QK^T` by `1/sqrt(d)`: the
/// scaling is folded into the weight initialization.
#[derive(Debug, Clone)]
pub struct T5Attention {
    /// Query projection [d_model] -> [num_heads * d_kv].
    q: Linear,
    /// Key projection [d_model] -> [num_heads * d_kv].
    k: Linear,
    /// Value projection [d_model] -> [num_heads * d_kv].
    v: Linear,
    /// Output projection [num_heads * d_kv] -> [d_model].
    o: Linear,
    /// Learned relative position bias (first block only).
    relative_attention_bias: Option<RelativePositionBias>,
    /// Number of heads.
    n_heads: usize,
    /// Dimension per head.
    d_kv: usize,
    /// Cached keys/values [batch, heads, seq, d_kv].
    kv_cache: Option<(Tensor, Tensor)>,
    /// Keep the raw scores of the first query on the next call.
    store_scores: bool,
    /// Stored raw scores [batch, heads, 1, key_len].
    score_storage: Option<Tensor>,
}

impl T5Attention {
    /// Loads an attention layer from a VarBuilder.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Reader configuration
    /// * `has_relative_attention_bias` - Whether this layer owns the bias table
    /// * `bidirectional` - Bucket positions in both directions (encoder)
    /// * `vb` - VarBuilder pointing at `SelfAttention` or `EncDecAttention`
    pub fn new(
        cfg: &ReaderConfig,
        has_relative_attention_bias: bool,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = cfg.inner_dim();
        let q = linear_no_bias(cfg.d_model, inner_dim, vb.pp("q"))?;
        let k = linear_no_bias(cfg.d_model, inner_dim, vb.pp("k"))?;
        let v = linear_no_bias(cfg.d_model, inner_dim, vb.pp("v"))?;
        let o = linear_no_bias(inner_dim, cfg.d_model, vb.pp("o"))?;

        let relative_attention_bias = if has_relative_attention_bias {
            Some(RelativePositionBias::new(
                cfg.relative_attention_num_buckets,
                cfg.relative_attention_max_distance,
                cfg.num_heads,
                bidirectional,
                vb.pp("relative_attention_bias"),
            )?)
        } else {
            None
        };

        Ok(Self {
            q,
            k,
            v,
            o,
            relative_attention_bias,
            n_heads: cfg.num_heads,
            d_kv: cfg.d_kv,
            kv_cache: None,
            store_scores: false,
            score_storage: None,
        })
    }

    /// Returns the number of heads.
    pub fn num_heads(&self) -> usize {
        self.n_heads
    }

    /// Returns the head dimension.
    pub fn d_kv(&self) -> usize {
        self.d_kv
    }

    /// Whether this layer owns a relative position bias table.
    pub fn has_relative_attention_bias(&self) -> bool {
        self.relative_attention_bias.is_some()
    }

    /// Number of positions currently held in the KV cache.
    pub fn cached_len(&self) -> usize {
        self.kv_cache
            .as_ref()
            .map(|(k, _)| k.dims()[2])
            .unwrap_or(0)
    }

    /// Drops cached keys and values.
    pub fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }

    /// Turns raw score storage on or off.
    pub fn set_score_storage(&mut self, enabled: bool) {
        self.store_scores = enabled;
        if !enabled {
            self.score_storage = None;
        }
    }

    /// Whether raw score storage is on.
    pub fn stores_scores(&self) -> bool {
        self.store_scores
    }

    /// Empties the score storage so the next call records again.
    pub fn reset_score_storage(&mut self) {
        self.score_storage = None;
    }

    /// Raw scores of the first query of the first call since the last reset.
    pub fn score_storage(&self) -> Option<&Tensor> {
        self.score_storage.as_ref()
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Query side [batch, q_len, d_model]
    /// * `key_value_states` - Encoder output for cross-attention, `None` for self-attention
    /// * `mask` - Additive bias broadcastable to [batch, heads, q_len, k_len]
    /// * `position_bias` - Bias computed by an earlier layer of the same stack
    /// * `use_cache` - Read and update the KV cache
    ///
    /// # Returns
    ///
    /// `(output [batch, q_len, d_model], position_bias)`; the position bias
    /// is `None` when neither an input bias nor a bias table exists.
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch_size, q_len, _) = hidden_states.dims3()?;

        let q = self.split_heads(&self.q.forward(hidden_states)?, batch_size)?;

        let (k, v) = match key_value_states {
            // Cross-attention: encoder keys/values never change during decoding.
            Some(kv) => {
                let cached = if use_cache { self.kv_cache.clone() } else { None };
                match cached {
                    Some(cached) => cached,
                    None => {
                        let k = self.split_heads(&self.k.forward(kv)?, batch_size)?;
                        let v = self.split_heads(&self.v.forward(kv)?, batch_size)?;
                        if use_cache {
                            self.kv_cache = Some((k.clone(), v.clone()));
                        }
                        (k, v)
                    }
                }
            }
            None => {
                let k = self.split_heads(&self.k.forward(hidden_states)?, batch_size)?;
                let v = self.split_heads(&self.v.forward(hidden_states)?, batch_size)?;
                if use_cache {
                    let (k, v) = match &self.kv_cache {
                        Some((k_cache, v_cache)) => (
                            Tensor::cat(&[k_cache, &k], 2)?.contiguous()?,
                            Tensor::cat(&[v_cache, &v], 2)?.contiguous()?,
                        ),
                        None => (k, v),
                    };
                    self.kv_cache = Some((k.clone(), v.clone()));
                    (k, v)
                } else {
                    (k, v)
                }
            }
        };
        let k_len = k.dim(2)?;

        // [batch, heads, q_len, k_len]
        let mut scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;

        let position_bias = match (position_bias, &self.relative_attention_bias) {
            (Some(bias), _) => Some(bias.clone()),
            (None, Some(table)) => {
                Some(table.forward(q_len, k_len, q.device())?.to_dtype(scores.dtype())?)
            }
            (None, None) => None,
        };
        if let Some(bias) = &position_bias {
            scores = scores.broadcast_add(bias)?;
        }
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }

        if self.store_scores && self.score_storage.is_none() {
            self.score_storage = Some(scores.narrow(2, 0, 1)?.contiguous()?);
        }

        let dtype = scores.dtype();
        let attn = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

        let output = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, q_len, self.n_heads * self.d_kv))?;

        Ok((self.o.forward(&output)?, position_bias))
    }

    /// [batch, seq, heads * d_kv] -> [batch, heads, seq, d_kv]
    fn split_heads(&self, x: &Tensor, batch_size: usize) -> Result<Tensor> {
        x.reshape((batch_size, (), self.n_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()
    }
}
