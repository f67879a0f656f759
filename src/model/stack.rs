//! T5 stack (encoder or decoder).
//!
//! ```text
//! Token IDs
//!     │
//!     ▼
//! shared embedding          vocab_size → d_model
//!     │
//!     ▼
//! T5Block × num_layers      block 0 computes the relative position bias,
//!     │                     later blocks reuse it
//!     ▼
//! final_layer_norm
//! ```

use candle_core::{Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::attention::{causal_bias, padding_bias};
use super::block::{BlockInputs, T5Block};
use super::checkpoint::CheckpointWrapper;
use super::norm::T5LayerNorm;
use crate::config::ReaderConfig;

/// A T5 encoder or decoder stack.
#[derive(Debug, Clone)]
pub struct T5Stack {
    /// Token embedding shared with the other stack and the LM head.
    embed_tokens: Embedding,
    /// Transformer blocks.
    blocks: Vec<CheckpointWrapper>,
    /// Final layer normalization.
    final_layer_norm: T5LayerNorm,
    /// Causal decoder stack with cross-attention.
    is_decoder: bool,
}

impl T5Stack {
    /// Loads a stack from a VarBuilder pointing at `encoder` or `decoder`.
    pub fn new(
        cfg: &ReaderConfig,
        is_decoder: bool,
        embed_tokens: Embedding,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_layers = if is_decoder {
            cfg.decoder_layers()
        } else {
            cfg.num_layers
        };

        let mut blocks = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let block = T5Block::new(cfg, i == 0, is_decoder, vb.pp(format!("block.{i}")))?;
            blocks.push(CheckpointWrapper::new(block, false));
        }

        let final_layer_norm = T5LayerNorm::load(
            cfg.d_model,
            cfg.layer_norm_epsilon,
            vb.pp("final_layer_norm"),
        )?;

        Ok(Self {
            embed_tokens,
            blocks,
            final_layer_norm,
            is_decoder,
        })
    }

    /// Whether this is the decoder stack.
    pub fn is_decoder(&self) -> bool {
        self.is_decoder
    }

    /// Returns the number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Iterates over the blocks.
    pub fn blocks(&self) -> impl Iterator<Item = &T5Block> {
        self.blocks.iter().map(CheckpointWrapper::module)
    }

    /// Iterates mutably over the blocks.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut T5Block> {
        self.blocks.iter_mut().map(CheckpointWrapper::module_mut)
    }

    /// Enables or disables checkpoint mode on every block.
    pub fn set_checkpoint(&mut self, use_checkpoint: bool) {
        for block in &mut self.blocks {
            block.set_checkpoint(use_checkpoint);
        }
    }

    /// Whether every block runs in checkpoint mode.
    pub fn uses_checkpoint(&self) -> bool {
        self.blocks.iter().all(CheckpointWrapper::use_checkpoint)
    }

    /// Number of decoder positions held in the KV cache.
    pub fn cached_len(&self) -> usize {
        self.blocks()
            .next()
            .map(|block| block.self_attention().cached_len())
            .unwrap_or(0)
    }

    /// Drops every KV cache of the stack.
    pub fn clear_kv_cache(&mut self) {
        for block in self.blocks_mut() {
            block.clear_kv_cache();
        }
    }

    /// Forward pass through the stack.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs [batch, seq_len]
    /// * `attention_mask` - 0/1 padding mask [batch, seq_len] (encoder only)
    /// * `encoder_hidden_states` - Encoder output [batch, src_len, d_model] (decoder only)
    /// * `encoder_attention_mask` - 0/1 padding mask [batch, src_len] (decoder only)
    /// * `use_cache` - Incremental decoding with KV caches (decoder only)
    ///
    /// # Returns
    ///
    /// Hidden states [batch, seq_len, d_model]
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        let dtype = hidden_states.dtype();

        let self_mask = if self.is_decoder {
            let past_len = if use_cache { self.cached_len() } else { 0 };
            if seq_len > 1 {
                Some(causal_bias(
                    seq_len,
                    past_len + seq_len,
                    dtype,
                    input_ids.device(),
                )?)
            } else {
                None
            }
        } else {
            attention_mask.map(|m| padding_bias(m, dtype)).transpose()?
        };
        let cross_mask = encoder_attention_mask
            .map(|m| padding_bias(m, dtype))
            .transpose()?;

        let mut position_bias: Option<Tensor> = None;
        for block in &mut self.blocks {
            let inputs = BlockInputs {
                self_mask: self_mask.as_ref(),
                position_bias: position_bias.as_ref(),
                encoder_hidden_states,
                cross_mask: cross_mask.as_ref(),
                use_cache: use_cache && self.is_decoder,
            };
            let (next, bias) = block.forward(&hidden_states, inputs)?;
            hidden_states = next;
            if position_bias.is_none() {
                position_bias = bias;
            }
        }

        self.final_layer_norm.forward(&hidden_states)
    }
}
