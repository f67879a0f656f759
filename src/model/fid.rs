//! Fusion-in-Decoder T5 reader.
//!
//! `FidT5` is a T5 encoder-decoder whose encoder is a [`FidEncoder`]. Inputs
//! are shaped `[batch, n_passages, passage_length]`; they are flattened to
//! `[batch, n_passages * passage_length]` before reaching the encoder, which
//! splits them again per passage. The decoder then attends over the fused
//! representation of all passages.
//!
//! The wrappers add no parameters, so plain T5 checkpoints (`t5-base`,
//! `t5-large`, ...) load as they are. Trained FiD checkpoints store the
//! encoder with its wrappers in place (`encoder.encoder.block.{i}.module.*`,
//! `encoder.encoder.final_layer_norm.*`); [`FidT5::new`] detects that layout
//! and maps it back onto the plain T5 names.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::debug;

use super::encoder::FidEncoder;
use super::scores::aggregate_crossattention_scores;
use super::stack::T5Stack;
use crate::config::ReaderConfig;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Present only in checkpoints saved with the FiD encoder wrappers.
const WRAPPED_ENCODER_MARKER: &str = "encoder.encoder.final_layer_norm.weight";

/// Maps a plain T5 encoder tensor name onto the wrapped FiD layout.
///
/// `encoder.block.{i}.rest` becomes `encoder.encoder.block.{i}.module.rest`,
/// any other `encoder.rest` becomes `encoder.encoder.rest`.
fn wrapped_encoder_name(name: &str) -> String {
    let Some(rest) = name.strip_prefix("encoder.") else {
        return name.to_string();
    };
    if let Some((index, tail)) = rest
        .strip_prefix("block.")
        .and_then(|block| block.split_once('.'))
    {
        return format!("encoder.encoder.block.{index}.module.{tail}");
    }
    format!("encoder.encoder.{rest}")
}

/// Output of a forward pass over known decoder inputs.
#[derive(Debug, Clone)]
pub struct Seq2SeqOutput {
    /// Logits [batch, target_len, vocab_size].
    pub logits: Tensor,
    /// Mean token cross-entropy, when labels were given.
    pub loss: Option<Tensor>,
}

/// Fusion-in-Decoder T5 model.
#[derive(Debug, Clone)]
pub struct FidT5 {
    /// Token embedding shared by encoder, decoder and (tied) LM head.
    shared: Embedding,
    /// Multi-passage encoder.
    encoder: FidEncoder,
    /// Causal decoder with cross-attention.
    decoder: T5Stack,
    /// Projection to the vocabulary.
    lm_head: Linear,
    /// Model configuration.
    config: ReaderConfig,
    /// Device.
    device: Device,
    /// Data type.
    dtype: DType,
}

impl FidT5 {
    /// Creates a FidT5 from a VarBuilder over a T5 or FiD checkpoint.
    pub fn new(config: &ReaderConfig, vb: VarBuilder) -> Result<Self> {
        let vb = if vb.contains_tensor(WRAPPED_ENCODER_MARKER) {
            debug!("checkpoint stores wrapped FiD encoder names");
            vb.rename_f(wrapped_encoder_name)
        } else {
            vb
        };
        let shared = embedding(config.vocab_size, config.d_model, vb.pp("shared"))?;

        let encoder_stack = T5Stack::new(config, false, shared.clone(), vb.pp("encoder"))?;
        let encoder = FidEncoder::new(
            encoder_stack,
            config.d_model,
            config.passage_position_embedding,
        );
        let decoder = T5Stack::new(config, true, shared.clone(), vb.pp("decoder"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(shared.embeddings().clone(), None)
        } else {
            linear_no_bias(config.d_model, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            shared,
            encoder,
            decoder,
            lm_head,
            config: config.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Returns the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the shared token embedding.
    pub fn shared(&self) -> &Embedding {
        &self.shared
    }

    /// Returns the FiD encoder.
    pub fn encoder(&self) -> &FidEncoder {
        &self.encoder
    }

    /// Returns the FiD encoder, mutably.
    pub fn encoder_mut(&mut self) -> &mut FidEncoder {
        &mut self.encoder
    }

    /// Returns the decoder stack.
    pub fn decoder(&self) -> &T5Stack {
        &self.decoder
    }

    /// Number of passages the encoder currently splits its input into.
    pub fn n_passages(&self) -> usize {
        self.encoder.n_passages()
    }

    /// Enables or disables checkpoint mode in the encoder blocks.
    pub fn set_checkpoint(&mut self, use_checkpoint: bool) {
        self.encoder.stack_mut().set_checkpoint(use_checkpoint);
    }

    /// Drops the decoder KV caches.
    pub fn clear_kv_cache(&mut self) {
        self.decoder.clear_kv_cache();
    }

    /// Makes every decoder cross-attention layer keep raw scores.
    pub fn enable_score_storage(&mut self) {
        for block in self.decoder.blocks_mut() {
            if let Some(attn) = block.cross_attention_mut() {
                attn.set_score_storage(true);
            }
        }
    }

    /// Clears stored cross-attention scores so the next decode records again.
    pub fn reset_score_storage(&mut self) {
        for block in self.decoder.blocks_mut() {
            if let Some(attn) = block.cross_attention_mut() {
                attn.reset_score_storage();
            }
        }
    }

    /// Aggregates stored cross-attention scores into one score per passage.
    ///
    /// # Arguments
    ///
    /// * `context_mask` - 0/1 passage mask [batch, n_passages, passage_length]
    ///
    /// # Returns
    ///
    /// Passage scores [batch, n_passages]
    pub fn get_crossattention_scores(&self, context_mask: &Tensor) -> Result<Tensor> {
        let mut layer_scores = Vec::with_capacity(self.decoder.num_blocks());
        for block in self.decoder.blocks() {
            match block.cross_attention().and_then(|attn| attn.score_storage()) {
                Some(scores) => layer_scores.push(scores.clone()),
                None => candle_core::bail!(
                    "cross-attention scores were not stored; call enable_score_storage before decoding"
                ),
            }
        }
        aggregate_crossattention_scores(&layer_scores, context_mask)
    }

    /// Flattens `[batch, n_passages, len]` to `[batch, n_passages * len]`.
    fn flatten_passages(x: &Tensor) -> Result<Tensor> {
        match x.rank() {
            2 => Ok(x.clone()),
            3 => {
                let (batch_size, n_passages, len) = x.dims3()?;
                x.reshape((batch_size, n_passages * len))
            }
            rank => candle_core::bail!("expected 2D or 3D passage tensor, got {rank}D"),
        }
    }

    /// Runs the FiD encoder.
    ///
    /// A 3D `input_ids` records its passage count; a 2D input reuses the
    /// previously recorded one.
    ///
    /// # Returns
    ///
    /// `(encoder_hidden_states [batch, n_passages * len, d_model], flattened mask)`
    pub fn encode(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if input_ids.rank() == 3 {
            self.encoder.set_n_passages(input_ids.dim(1)?);
        }
        let input_ids = Self::flatten_passages(input_ids)?;
        let attention_mask = attention_mask.map(Self::flatten_passages).transpose()?;
        let hidden_states = self.encoder.forward(&input_ids, attention_mask.as_ref())?;
        Ok((hidden_states, attention_mask))
    }

    /// Runs the decoder and LM head.
    ///
    /// # Returns
    ///
    /// Logits [batch, target_len, vocab_size]
    pub fn decode(
        &mut self,
        decoder_input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<Tensor> {
        let hidden_states = self.decoder.forward(
            decoder_input_ids,
            None,
            Some(encoder_hidden_states),
            encoder_attention_mask,
            use_cache,
        )?;
        // Tied T5 checkpoints rescale before projecting onto the embedding matrix.
        let hidden_states = if self.config.tie_word_embeddings {
            (hidden_states * (self.config.d_model as f64).powf(-0.5))?
        } else {
            hidden_states
        };
        self.lm_head.forward(&hidden_states)
    }

    /// Builds decoder inputs from labels: prepend the start token, drop the
    /// last label, and replace ignored positions by the pad token.
    ///
    /// # Arguments
    ///
    /// * `labels` - Target ids [batch, target_len], `IGNORE_INDEX` for ignored positions
    pub fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        let labels = labels.to_dtype(DType::I64)?;
        let (batch_size, target_len) = labels.dims2()?;
        let start = Tensor::full(
            self.config.decoder_start_token_id as i64,
            (batch_size, 1),
            labels.device(),
        )?;
        let shifted = if target_len > 1 {
            Tensor::cat(&[&start, &labels.narrow(1, 0, target_len - 1)?], 1)?
        } else {
            start
        };
        let pad = Tensor::full(
            self.config.pad_token_id as i64,
            shifted.shape(),
            shifted.device(),
        )?;
        shifted
            .ge(&shifted.zeros_like()?)?
            .where_cond(&shifted, &pad)?
            .to_dtype(DType::U32)
    }

    /// Forward pass over known decoder inputs (training and scoring).
    ///
    /// # Arguments
    ///
    /// * `input_ids` - [batch, n_passages, len] or flattened [batch, n_passages * len]
    /// * `attention_mask` - Same shape as `input_ids`
    /// * `decoder_input_ids` - [batch, target_len]; derived from `labels` when absent
    /// * `labels` - [batch, target_len], `IGNORE_INDEX` for ignored positions
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        decoder_input_ids: Option<&Tensor>,
        labels: Option<&Tensor>,
    ) -> Result<Seq2SeqOutput> {
        let decoder_input_ids = match (decoder_input_ids, labels) {
            (Some(ids), _) => ids.clone(),
            (None, Some(labels)) => self.shift_right(labels)?,
            (None, None) => candle_core::bail!("forward needs decoder_input_ids or labels"),
        };

        let (encoder_hidden_states, attention_mask) = self.encode(input_ids, attention_mask)?;
        let logits = self.decode(
            &decoder_input_ids,
            &encoder_hidden_states,
            attention_mask.as_ref(),
            false,
        )?;

        let loss = labels
            .map(|labels| cross_entropy_ignoring(&logits, labels))
            .transpose()?;

        Ok(Seq2SeqOutput { logits, loss })
    }

    /// Greedy generation.
    ///
    /// See [`FidT5::generate_with`].
    pub fn generate(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        max_length: usize,
    ) -> Result<Vec<Vec<u32>>> {
        self.generate_with(input_ids, attention_mask, max_length, |logits| {
            logits.argmax(D::Minus1)?.to_vec1::<u32>()
        })
    }

    /// Autoregressive generation with a caller-supplied token selector.
    ///
    /// `max_length` bounds the decoder sequence including its start token,
    /// so at most `max_length - 1` tokens are produced per example (EOS
    /// included). `max_length` 0 or 1 generates nothing.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - [batch, n_passages, len]
    /// * `attention_mask` - [batch, n_passages, len]
    /// * `max_length` - Maximum decoder length, start token included
    /// * `next_tokens` - Maps last-position logits [batch, vocab_size] to one token per row
    ///
    /// # Returns
    ///
    /// Generated token IDs per example, without the start token and EOS.
    pub fn generate_with<F>(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        max_length: usize,
        mut next_tokens: F,
    ) -> Result<Vec<Vec<u32>>>
    where
        F: FnMut(&Tensor) -> Result<Vec<u32>>,
    {
        let (batch_size, n_passages, _) = input_ids.dims3()?;
        self.clear_kv_cache();

        let (encoder_hidden_states, attention_mask) =
            self.encode(input_ids, Some(attention_mask))?;
        debug!(batch_size, n_passages, max_length, "generating answers");

        let eos = self.config.eos_token_id;
        let pad = self.config.pad_token_id;
        let mut current = vec![self.config.decoder_start_token_id; batch_size];
        let mut outputs: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut finished = vec![false; batch_size];

        for _ in 1..max_length {
            let step_ids = Tensor::from_vec(current.clone(), (batch_size, 1), &self.device)?;
            let logits = self
                .decode(
                    &step_ids,
                    &encoder_hidden_states,
                    attention_mask.as_ref(),
                    true,
                )?
                .squeeze(1)?
                .to_dtype(DType::F32)?;

            let tokens = next_tokens(&logits)?;
            if tokens.len() != batch_size {
                candle_core::bail!(
                    "token selector returned {} tokens for a batch of {batch_size}",
                    tokens.len()
                );
            }

            for (b, &token) in tokens.iter().enumerate() {
                if finished[b] {
                    current[b] = pad;
                } else if token == eos {
                    finished[b] = true;
                    current[b] = pad;
                } else {
                    outputs[b].push(token);
                    current[b] = token;
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }
        }

        self.clear_kv_cache();
        Ok(outputs)
    }
}

/// Mean token cross-entropy over positions whose label is not `IGNORE_INDEX`.
///
/// # Arguments
///
/// * `logits` - [batch, target_len, vocab_size]
/// * `labels` - [batch, target_len]
pub fn cross_entropy_ignoring(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::I64)?;
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

    let valid = labels.ge(&labels.zeros_like()?)?;
    let safe_labels = valid
        .where_cond(&labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?
        .unsqueeze(2)?
        .contiguous()?;

    let picked = log_probs.gather(&safe_labels, 2)?.squeeze(2)?;
    let picked = valid.where_cond(&picked, &picked.zeros_like()?)?;

    let count = valid.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    // An all-ignored batch yields zero loss.
    picked.sum_all()?.neg()? / f64::from(count.max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_entropy_ignores_masked_labels() {
        let device = Device::Cpu;
        // Uniform logits over 4 tokens: every kept position costs ln(4).
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[2i64, IGNORE_INDEX, 1]], &device).unwrap();

        let loss: f32 = cross_entropy_ignoring(&logits, &labels)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_wrapped_encoder_names() {
        assert_eq!(
            wrapped_encoder_name("encoder.block.3.layer.0.SelfAttention.q.weight"),
            "encoder.encoder.block.3.module.layer.0.SelfAttention.q.weight"
        );
        assert_eq!(
            wrapped_encoder_name("encoder.final_layer_norm.weight"),
            WRAPPED_ENCODER_MARKER
        );
        assert_eq!(
            wrapped_encoder_name("decoder.block.0.layer.1.EncDecAttention.k.weight"),
            "decoder.block.0.layer.1.EncDecAttention.k.weight"
        );
        assert_eq!(wrapped_encoder_name("shared.weight"), "shared.weight");
    }

    #[test]
    fn test_shift_right() {
        let device = Device::Cpu;
        let model = FidT5::new(
            &ReaderConfig {
                vocab_size: 16,
                d_model: 8,
                d_kv: 4,
                d_ff: 16,
                num_layers: 1,
                num_heads: 2,
                ..ReaderConfig::default()
            },
            VarBuilder::zeros(DType::F32, &device),
        )
        .unwrap();

        let labels = Tensor::new(&[[5i64, 6, IGNORE_INDEX]], &device).unwrap();
        let shifted: Vec<Vec<u32>> = model.shift_right(&labels).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![0, 5, 6]]);

        let labels = Tensor::new(&[[IGNORE_INDEX, 3]], &device).unwrap();
        let shifted: Vec<Vec<u32>> = model.shift_right(&labels).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![0, 0]]);
    }
}
