//! BERT encoder backing the dual-encoder retriever.
//!
//! ```text
//! input_ids [B, L]
//!     │
//!     ▼
//! word + position + token_type embeddings → LayerNorm
//!     │
//!     ▼
//! BertLayer × num_hidden_layers
//!     ├─ self-attention (bidirectional, optional padding mask)
//!     ├─ dense + residual + LayerNorm
//!     └─ GELU feed-forward + residual + LayerNorm
//!     │
//!     ▼
//! last hidden state [B, L, H]
//! ```
//!
//! Unlike T5, BERT uses post-norm residuals, absolute positions, biased linear
//! layers and scaled dot-product attention. The pooler is not needed for
//! retrieval and is not loaded.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

use super::attention::padding_bias;
use crate::config::RetrieverConfig;

#[derive(Debug, Clone)]
struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    max_position_embeddings: usize,
}

impl BertEmbeddings {
    fn new(cfg: &RetrieverConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, hidden, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                cfg.type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            max_position_embeddings: cfg.max_position_embeddings,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            candle_core::bail!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            );
        }
        let device = input_ids.device();

        let words = self.word_embeddings.forward(input_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?
            .unsqueeze(0)?
            .broadcast_as((batch_size, seq_len))?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        // Single-segment input.
        let token_type_ids = Tensor::zeros((batch_size, seq_len), DType::U32, device)?;
        let token_types = self.token_type_embeddings.forward(&token_type_ids)?;

        self.layer_norm
            .forward(&((words + positions)? + token_types)?)
    }
}

#[derive(Debug, Clone)]
struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {
    fn new(cfg: &RetrieverConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let self_vb = vb.pp("self");
        let out_vb = vb.pp("output");
        Ok(Self {
            query: linear(hidden, hidden, self_vb.pp("query"))?,
            key: linear(hidden, hidden, self_vb.pp("key"))?,
            value: linear(hidden, hidden, self_vb.pp("value"))?,
            output: linear(hidden, hidden, out_vb.pp("dense"))?,
            output_norm: layer_norm(hidden, cfg.layer_norm_eps, out_vb.pp("LayerNorm"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: hidden / cfg.num_attention_heads,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len, hidden) = hidden_states.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden_states)?)?;
        let k = self.split_heads(&self.key.forward(hidden_states)?)?;
        let v = self.split_heads(&self.value.forward(hidden_states)?)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = match mask_bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, hidden))?;

        let projected = self.output.forward(&context)?;
        self.output_norm.forward(&(projected + hidden_states)?)
    }
}

#[derive(Debug, Clone)]
struct BertLayer {
    attention: BertSelfAttention,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
}

impl BertLayer {
    fn new(cfg: &RetrieverConfig, vb: VarBuilder) -> Result<Self> {
        let out_vb = vb.pp("output");
        Ok(Self {
            attention: BertSelfAttention::new(cfg, vb.pp("attention"))?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: linear(cfg.intermediate_size, cfg.hidden_size, out_vb.pp("dense"))?,
            output_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, out_vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: Option<&Tensor>) -> Result<Tensor> {
        let attended = self.attention.forward(hidden_states, mask_bias)?;
        let ff = self.intermediate.forward(&attended)?.gelu_erf()?;
        let ff = self.output.forward(&ff)?;
        self.output_norm.forward(&(ff + attended)?)
    }
}

/// BERT encoder returning the last hidden state.
#[derive(Debug, Clone)]
pub struct BertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    hidden_size: usize,
}

impl BertModel {
    /// Loads BERT weights rooted at `vb` (`embeddings.*`, `encoder.layer.{i}.*`).
    pub fn new(cfg: &RetrieverConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = BertEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| BertLayer::new(cfg, vb.pp(format!("encoder.layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings,
            layers,
            hidden_size: cfg.hidden_size,
        })
    }

    /// Hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Number of encoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encodes a batch of token sequences.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs [batch, seq_len]
    /// * `attention_mask` - Optional 0/1 padding mask [batch, seq_len]
    ///
    /// # Returns
    ///
    /// Last hidden state [batch, seq_len, hidden_size]
    pub fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let mut hidden_states = self.embeddings.forward(input_ids)?;
        let mask_bias = attention_mask
            .map(|m| padding_bias(m, hidden_states.dtype()))
            .transpose()?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, mask_bias.as_ref())?;
        }
        Ok(hidden_states)
    }
}
