//! Cross-attention score aggregation.
//!
//! Averaging the cross-attention scores of the first decoded token over
//! heads, layers and the tokens of a passage yields one scalar per passage,
//! which serves as a question/passage relevance score (the signal used to
//! distil a reader into a retriever, <https://arxiv.org/abs/2012.04584>).

use candle_core::{DType, Result, Tensor};

/// Aggregates per-layer raw cross-attention scores into passage scores.
///
/// # Arguments
///
/// * `layer_scores` - One tensor per decoder layer, [batch, heads, 1, n_passages * passage_length]
/// * `context_mask` - 0/1 passage mask [batch, n_passages, passage_length]
///
/// # Returns
///
/// Passage scores [batch, n_passages] (f32)
///
/// # Formula
///
/// ```text
/// score[b, p] = sum_{h, l, t: mask[b, p, t]} s[b, h, l, p, t] / (tokens[b, p] * layers * heads)
/// ```
pub fn aggregate_crossattention_scores(
    layer_scores: &[Tensor],
    context_mask: &Tensor,
) -> Result<Tensor> {
    if layer_scores.is_empty() {
        candle_core::bail!("no cross-attention scores were stored");
    }
    let (batch_size, n_passages, passage_length) = context_mask.dims3()?;

    // [batch, heads, layers, n_passages * passage_length]
    let scores = Tensor::cat(layer_scores, 2)?.to_dtype(DType::F32)?;
    let (_, n_heads, n_layers, key_len) = scores.dims4()?;
    if key_len != n_passages * passage_length {
        candle_core::bail!(
            "stored scores cover {key_len} keys but the context mask has {n_passages}x{passage_length}"
        );
    }
    let scores = scores.reshape((batch_size, n_heads, n_layers, n_passages, passage_length))?;

    let mask = context_mask.to_dtype(DType::F32)?;
    let keep = mask
        .gt(&mask.zeros_like()?)?
        .reshape((batch_size, 1, 1, n_passages, passage_length))?
        .broadcast_as(scores.shape())?;
    let scores = keep.where_cond(&scores, &scores.zeros_like()?)?;

    // Sum over tokens, layers and heads -> [batch, n_passages]
    let totals = scores.sum(4)?.sum(2)?.sum(1)?;
    let ntokens = (mask.sum(2)? * (n_layers * n_heads) as f64)?;
    totals.broadcast_div(&ntokens)
}
