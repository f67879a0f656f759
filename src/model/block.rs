//! T5 block implementation.
//!
//! A block is a stack of pre-norm residual sub-layers:
//!
//! ```text
//! layer.0  self-attention        x = x + SelfAttention(norm(x))
//! layer.1  cross-attention       x = x + EncDecAttention(norm(x), encoder)   (decoder only)
//! layer.N  feed-forward          x = x + DenseReluDense(norm(x))
//! ```

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::T5Attention;
use super::mlp::T5LayerFF;
use super::norm::T5LayerNorm;
use crate::config::ReaderConfig;

/// Attention sub-layer with its pre-norm.
#[derive(Debug, Clone)]
struct T5LayerAttention {
    attention: T5Attention,
    layer_norm: T5LayerNorm,
}

impl T5LayerAttention {
    fn new(
        cfg: &ReaderConfig,
        has_relative_attention_bias: bool,
        bidirectional: bool,
        attention_name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attention = T5Attention::new(
            cfg,
            has_relative_attention_bias,
            bidirectional,
            vb.pp(attention_name),
        )?;
        let layer_norm =
            T5LayerNorm::load(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?;
        Ok(Self {
            attention,
            layer_norm,
        })
    }

    fn forward(
        &mut self,
        hidden_states: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let normed = self.layer_norm.forward(hidden_states)?;
        let (ys, position_bias) =
            self.attention
                .forward(&normed, key_value_states, mask, position_bias, use_cache)?;
        Ok(((hidden_states + ys)?, position_bias))
    }
}

/// Inputs shared by every block of a stack for one forward pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInputs<'a> {
    /// Additive self-attention bias (padding or causal).
    pub self_mask: Option<&'a Tensor>,
    /// Self-attention position bias from the first block.
    pub position_bias: Option<&'a Tensor>,
    /// Encoder output [batch, src_len, d_model] (decoder only).
    pub encoder_hidden_states: Option<&'a Tensor>,
    /// Additive cross-attention bias over encoder padding.
    pub cross_mask: Option<&'a Tensor>,
    /// Read and update the decoder KV caches.
    pub use_cache: bool,
}

/// T5 block (encoder or decoder).
#[derive(Debug, Clone)]
pub struct T5Block {
    /// Self-attention sub-layer (`layer.0`).
    self_attn: T5LayerAttention,
    /// Cross-attention sub-layer (`layer.1`, decoder only).
    cross_attn: Option<T5LayerAttention>,
    /// Feed-forward sub-layer (last layer index).
    ff: T5LayerFF,
}

impl T5Block {
    /// Loads a block from a VarBuilder pointing at `block.{i}`.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Reader configuration
    /// * `has_relative_attention_bias` - `true` for the first block of a stack
    /// * `is_decoder` - Build the causal decoder variant with cross-attention
    /// * `vb` - VarBuilder for loading weights
    pub fn new(
        cfg: &ReaderConfig,
        has_relative_attention_bias: bool,
        is_decoder: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("layer");
        let self_attn = T5LayerAttention::new(
            cfg,
            has_relative_attention_bias,
            !is_decoder,
            "SelfAttention",
            vb.pp("0"),
        )?;
        let cross_attn = if is_decoder {
            Some(T5LayerAttention::new(
                cfg,
                false,
                false,
                "EncDecAttention",
                vb.pp("1"),
            )?)
        } else {
            None
        };
        let ff_index = if is_decoder { 2 } else { 1 };
        let ff = T5LayerFF::new(cfg, vb.pp(ff_index.to_string()))?;

        Ok(Self {
            self_attn,
            cross_attn,
            ff,
        })
    }

    /// Whether this is a decoder block.
    pub fn is_decoder(&self) -> bool {
        self.cross_attn.is_some()
    }

    /// Self-attention layer.
    pub fn self_attention(&self) -> &T5Attention {
        &self.self_attn.attention
    }

    /// Cross-attention layer (decoder blocks only).
    pub fn cross_attention(&self) -> Option<&T5Attention> {
        self.cross_attn.as_ref().map(|layer| &layer.attention)
    }

    /// Mutable cross-attention layer (decoder blocks only).
    pub fn cross_attention_mut(&mut self) -> Option<&mut T5Attention> {
        self.cross_attn.as_mut().map(|layer| &mut layer.attention)
    }

    /// Drops every KV cache held by the block.
    pub fn clear_kv_cache(&mut self) {
        self.self_attn.attention.clear_kv_cache();
        if let Some(cross) = &mut self.cross_attn {
            cross.attention.clear_kv_cache();
        }
    }

    /// Forward pass through the block.
    ///
    /// # Returns
    ///
    /// `(hidden_states [batch, seq, d_model], self-attention position bias)`
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        inputs: BlockInputs<'_>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (mut hidden_states, position_bias) = self.self_attn.forward(
            hidden_states,
            None,
            inputs.self_mask,
            inputs.position_bias,
            inputs.use_cache,
        )?;

        if let Some(cross_attn) = &mut self.cross_attn {
            let Some(encoder_hidden_states) = inputs.encoder_hidden_states else {
                candle_core::bail!("decoder block requires encoder hidden states for cross-attention");
            };
            (hidden_states, _) = cross_attn.forward(
                &hidden_states,
                Some(encoder_hidden_states),
                inputs.cross_mask,
                None,
                inputs.use_cache,
            )?;
        }

        let hidden_states = self.ff.forward(&hidden_states)?;
        Ok((hidden_states, position_bias))
    }
}
