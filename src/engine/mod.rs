//! Inference pipelines.
//!
//! This module contains:
//! - FidReader for answering questions over retrieved passages
//! - PassageRanker for scoring, ranking and embedding passages
//! - Sampler for answer token selection

pub mod ranker;
pub mod reader;
pub mod sampler;

pub use ranker::{PassageRanker, RankedPassage};
pub use reader::{Answer, FidReader};
pub use sampler::Sampler;
