//! Configuration types for fid-rs.
//!
//! `ReaderConfig` and `RetrieverConfig` mirror the `config.json` files shipped
//! with HuggingFace checkpoints; missing keys fall back to the defaults of
//! `t5-base` and `bert-base-uncased` respectively.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Feed-forward activation used inside the T5 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedForwardActivation {
    /// Plain ReLU (T5 v1.0).
    Relu,
    /// Tanh-approximated GELU (T5 v1.1, flan-t5).
    GeluNew,
    /// SiLU / Swish.
    Silu,
}

/// T5 reader configuration (HuggingFace `config.json` for T5 checkpoints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Model (hidden) dimension.
    pub d_model: usize,
    /// Dimension per attention head.
    pub d_kv: usize,
    /// Feed-forward inner dimension.
    pub d_ff: usize,
    /// Number of encoder blocks.
    pub num_layers: usize,
    /// Number of decoder blocks (defaults to `num_layers`).
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of relative position buckets.
    #[serde(default = "default_relative_attention_num_buckets")]
    pub relative_attention_num_buckets: usize,
    /// Distance beyond which all relative positions share a bucket.
    #[serde(default = "default_relative_attention_max_distance")]
    pub relative_attention_max_distance: usize,
    /// LayerNorm epsilon.
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Feed-forward projection, e.g. `relu` or `gated-gelu`.
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    /// Whether the LM head shares weights with the token embedding.
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: u32,
    /// End-of-sequence token id.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    /// First token fed to the decoder.
    #[serde(default)]
    pub decoder_start_token_id: u32,
    /// Add a sinusoidal per-passage embedding to the fused encoder output.
    #[serde(default = "default_true")]
    pub passage_position_embedding: bool,
}

fn default_relative_attention_num_buckets() -> usize {
    32
}

fn default_relative_attention_max_distance() -> usize {
    128
}

fn default_layer_norm_epsilon() -> f64 {
    1e-6
}

fn default_feed_forward_proj() -> String {
    "relu".to_string()
}

fn default_true() -> bool {
    true
}

fn default_eos_token_id() -> u32 {
    1
}

impl Default for ReaderConfig {
    fn default() -> Self {
        // t5-base
        Self {
            vocab_size: 32128,
            d_model: 768,
            d_kv: 64,
            d_ff: 3072,
            num_layers: 12,
            num_decoder_layers: None,
            num_heads: 12,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            layer_norm_epsilon: 1e-6,
            feed_forward_proj: default_feed_forward_proj(),
            tie_word_embeddings: true,
            pad_token_id: 0,
            eos_token_id: 1,
            decoder_start_token_id: 0,
            passage_position_embedding: true,
        }
    }
}

impl ReaderConfig {
    /// Number of decoder blocks.
    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    /// Attention inner dimension (`num_heads * d_kv`).
    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }

    /// Whether the feed-forward block is gated (`gated-*` projections).
    pub fn is_gated_act(&self) -> bool {
        self.feed_forward_proj.starts_with("gated-")
    }

    /// Parses the activation part of `feed_forward_proj`.
    pub fn activation(&self) -> Result<FeedForwardActivation> {
        let name = self
            .feed_forward_proj
            .strip_prefix("gated-")
            .unwrap_or(&self.feed_forward_proj);
        match name {
            "relu" => Ok(FeedForwardActivation::Relu),
            "gelu" | "gelu_new" => Ok(FeedForwardActivation::GeluNew),
            "silu" | "swish" => Ok(FeedForwardActivation::Silu),
            other => Err(Error::Config(format!(
                "unsupported feed_forward_proj activation `{other}`"
            ))),
        }
    }
}

/// Dual-encoder retriever configuration (BERT config plus indexing options).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Vocabulary size.
    #[serde(default = "default_bert_vocab_size")]
    pub vocab_size: usize,
    /// BERT hidden dimension.
    #[serde(default = "default_bert_hidden_size")]
    pub hidden_size: usize,
    /// Number of BERT layers.
    #[serde(default = "default_bert_num_layers")]
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    #[serde(default = "default_bert_num_heads")]
    pub num_attention_heads: usize,
    /// Feed-forward inner dimension.
    #[serde(default = "default_bert_intermediate_size")]
    pub intermediate_size: usize,
    /// Maximum absolute position.
    #[serde(default = "default_bert_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Number of segment (token type) ids.
    #[serde(default = "default_bert_type_vocab_size")]
    pub type_vocab_size: usize,
    /// LayerNorm epsilon.
    #[serde(default = "default_bert_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Dimension of the question/passage vectors.
    #[serde(default = "default_indexing_dimension")]
    pub indexing_dimension: usize,
    /// Use the attention mask when embedding questions.
    #[serde(default)]
    pub apply_question_mask: bool,
    /// Use the attention mask when embedding passages.
    #[serde(default)]
    pub apply_passage_mask: bool,
    /// Pool with the `[CLS]` token instead of averaging.
    #[serde(default)]
    pub extract_cls: bool,
    /// Maximum passage length in tokens.
    #[serde(default = "default_passage_maxlength")]
    pub passage_maxlength: usize,
    /// Maximum question length in tokens.
    #[serde(default = "default_question_maxlength")]
    pub question_maxlength: usize,
    /// Apply a linear projection + LayerNorm on top of BERT.
    #[serde(default = "default_true")]
    pub projection: bool,
}

fn default_bert_vocab_size() -> usize {
    30522
}

fn default_bert_hidden_size() -> usize {
    768
}

fn default_bert_num_layers() -> usize {
    12
}

fn default_bert_num_heads() -> usize {
    12
}

fn default_bert_intermediate_size() -> usize {
    3072
}

fn default_bert_max_position_embeddings() -> usize {
    512
}

fn default_bert_type_vocab_size() -> usize {
    2
}

fn default_bert_layer_norm_eps() -> f64 {
    1e-12
}

fn default_indexing_dimension() -> usize {
    768
}

fn default_passage_maxlength() -> usize {
    200
}

fn default_question_maxlength() -> usize {
    40
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        // bert-base-uncased with a 768-d projection
        Self {
            vocab_size: default_bert_vocab_size(),
            hidden_size: default_bert_hidden_size(),
            num_hidden_layers: default_bert_num_layers(),
            num_attention_heads: default_bert_num_heads(),
            intermediate_size: default_bert_intermediate_size(),
            max_position_embeddings: default_bert_max_position_embeddings(),
            type_vocab_size: default_bert_type_vocab_size(),
            layer_norm_eps: default_bert_layer_norm_eps(),
            indexing_dimension: default_indexing_dimension(),
            apply_question_mask: false,
            apply_passage_mask: false,
            extract_cls: false,
            passage_maxlength: default_passage_maxlength(),
            question_maxlength: default_question_maxlength(),
            projection: true,
        }
    }
}

impl RetrieverConfig {
    /// Checks that the configured dimensions are consistent.
    pub fn validate(&self) -> Result<()> {
        if !self.projection && self.indexing_dimension != self.hidden_size {
            return Err(Error::Config(format!(
                "without projection the indexing dimension ({}) must equal the hidden size ({})",
                self.indexing_dimension, self.hidden_size
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    /// Dimension of the vectors produced by `Retriever::embed_text`.
    pub fn output_dim(&self) -> usize {
        if self.projection {
            self.indexing_dimension
        } else {
            self.hidden_size
        }
    }
}

/// Sampling configuration for answer generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum decoder length including the start token.
    pub max_length: usize,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            max_length: 50,
            seed: None,
        }
    }
}

/// Input-side options for the reader pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderOptions {
    /// Number of passages fed to the reader per question (`None` = all).
    pub n_context: Option<usize>,
    /// Maximum length of each "question + passage" text in tokens.
    pub text_maxlength: usize,
    /// Maximum target length in tokens when computing the training loss.
    pub answer_maxlength: usize,
    /// Aggregate cross-attention scores per passage while answering.
    pub with_passage_scores: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            n_context: None,
            text_maxlength: 200,
            answer_maxlength: 32,
            with_passage_scores: false,
        }
    }
}
