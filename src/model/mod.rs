//! Model implementations.
//!
//! This module contains:
//! - The T5 building blocks (layer norm, attention, feed-forward, blocks, stacks)
//! - The Fusion-in-Decoder reader built on top of them
//! - The BERT dual-encoder retriever
//! - Model loading from HuggingFace or local checkpoints

pub mod attention;
pub mod bert;
pub mod block;
pub mod checkpoint;
pub mod encoder;
pub mod fid;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod position;
pub mod retriever;
pub mod scores;
pub mod stack;

pub use attention::{causal_bias, padding_bias, T5Attention};
pub use bert::BertModel;
pub use block::{BlockInputs, T5Block};
pub use checkpoint::CheckpointWrapper;
pub use encoder::FidEncoder;
pub use fid::{cross_entropy_ignoring, FidT5, Seq2SeqOutput, IGNORE_INDEX};
pub use loader::{download_model, load_config, load_weights, resolve_model, ModelFiles};
pub use mlp::T5LayerFF;
pub use norm::T5LayerNorm;
pub use position::{
    relative_position_bucket, sinusoid, PassagePositionEmbedding, RelativePositionBias,
};
pub use retriever::{Retriever, RetrieverOutput};
pub use scores::aggregate_crossattention_scores;
pub use stack::T5Stack;
