//! Fusion-in-Decoder encoder.
//!
//! The reader receives each question paired with N passages. Every passage is
//! encoded independently, then the encoder outputs are concatenated so the
//! decoder attends over all of them at once:
//!
//! ```text
//! input_ids [B, N·L]
//!     │ reshape
//!     ▼
//! [B·N, L] ──► T5 encoder stack ──► [B·N, L, D]
//!                                       │ reshape
//!                                       ▼
//!                                  [B, N·L, D] + passage position embedding
//! ```
//!
//! The input arrives flattened as `[B, N·L]` because the decoder side infers
//! its batch size from the encoder input; `n_passages` tells the wrapper how
//! to split it.

use candle_core::{Result, Tensor};

use super::position::PassagePositionEmbedding;
use super::stack::T5Stack;

/// Encoder wrapper turning a T5 encoder into a FiD encoder.
#[derive(Debug, Clone)]
pub struct FidEncoder {
    encoder: T5Stack,
    n_passages: usize,
    passage_position: Option<PassagePositionEmbedding>,
}

impl FidEncoder {
    /// Wraps a T5 encoder stack.
    ///
    /// # Arguments
    ///
    /// * `encoder` - Plain T5 encoder stack
    /// * `d_model` - Model dimension
    /// * `passage_position_embedding` - Add per-passage sinusoids to the output
    pub fn new(encoder: T5Stack, d_model: usize, passage_position_embedding: bool) -> Self {
        Self {
            encoder,
            n_passages: 1,
            passage_position: passage_position_embedding
                .then(|| PassagePositionEmbedding::new(d_model)),
        }
    }

    /// Number of passages per example used to split flattened input.
    pub fn n_passages(&self) -> usize {
        self.n_passages
    }

    /// Sets the number of passages per example.
    pub fn set_n_passages(&mut self, n_passages: usize) {
        self.n_passages = n_passages;
    }

    /// Whether passage position embeddings are added.
    pub fn uses_passage_position(&self) -> bool {
        self.passage_position.is_some()
    }

    /// The wrapped encoder stack.
    pub fn stack(&self) -> &T5Stack {
        &self.encoder
    }

    /// The wrapped encoder stack, mutably.
    pub fn stack_mut(&mut self) -> &mut T5Stack {
        &mut self.encoder
    }

    /// Unwraps the plain encoder stack.
    pub fn into_inner(self) -> T5Stack {
        self.encoder
    }

    /// Encodes flattened multi-passage input.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs [batch, n_passages * passage_length]
    /// * `attention_mask` - 0/1 mask with the same shape
    ///
    /// # Returns
    ///
    /// Fused hidden states [batch, n_passages * passage_length, d_model]
    pub fn forward(&mut self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, total_length) = input_ids.dims2()?;
        let n_passages = self.n_passages;
        if n_passages == 0 {
            candle_core::bail!("n_passages must be positive");
        }
        if total_length % n_passages != 0 {
            candle_core::bail!(
                "input length {total_length} is not divisible by {n_passages} passages"
            );
        }
        let passage_length = total_length / n_passages;

        let input_ids = input_ids.reshape((batch_size * n_passages, passage_length))?;
        let attention_mask = attention_mask
            .map(|m| m.reshape((batch_size * n_passages, passage_length)))
            .transpose()?;

        let hidden_states =
            self.encoder
                .forward(&input_ids, attention_mask.as_ref(), None, None, false)?;
        let d_model = hidden_states.dim(2)?;
        let hidden_states = hidden_states.reshape((batch_size, total_length, d_model))?;

        match &self.passage_position {
            Some(pe) => {
                let pe = pe.forward(
                    n_passages,
                    passage_length,
                    hidden_states.dtype(),
                    hidden_states.device(),
                )?;
                hidden_states.broadcast_add(&pe.unsqueeze(0)?)
            }
            None => Ok(hidden_states),
        }
    }
}
