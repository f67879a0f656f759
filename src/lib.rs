//! fid-rs: Fusion-in-Decoder question answering in Rust.
//!
//! This crate implements, on top of candle:
//! - A T5 reader that encodes each retrieved passage independently and
//!   decodes over all of them at once (Fusion-in-Decoder)
//! - Cross-attention passage scores taken from the reader's decoder
//! - A BERT dual-encoder retriever trained to match those scores
//! - Pipelines for answering, ranking and embedding, plus the `fid` CLI

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;

pub use config::{ReaderConfig, ReaderOptions, RetrieverConfig, SamplingConfig};
pub use data::{load_examples, save_examples, Collator, Example, Passage};
pub use engine::{Answer, FidReader, PassageRanker, RankedPassage, Sampler};
pub use error::{Error, Result};
pub use model::{
    download_model, load_config, load_weights, resolve_model, FidEncoder, FidT5, ModelFiles,
    Retriever, RetrieverOutput,
};
