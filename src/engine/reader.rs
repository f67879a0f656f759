//! Question answering with the FiD reader.
//!
//! ```text
//! Example (question + ctxs)
//!     │ format "question: .. title: .. context: .."
//!     ▼
//! Collator ──► ids / mask [B, N, L]
//!     │
//!     ▼
//! FidT5::generate_with (Sampler picks tokens)
//!     │                       └─ optional: cross-attention passage scores
//!     ▼
//! tokenizer.decode ──► answer text
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::sampler::Sampler;
use crate::config::{ReaderConfig, ReaderOptions, SamplingConfig};
use crate::data::{Collator, Example};
use crate::error::{Error, Result};
use crate::model::{load_config, load_weights, resolve_model, FidT5, IGNORE_INDEX};

/// A generated answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Decoded answer text.
    pub text: String,
    /// Generated token IDs (without start token and EOS).
    pub token_ids: Vec<u32>,
    /// Cross-attention relevance of each input passage.
    pub passage_scores: Option<Vec<f32>>,
}

/// FiD reader pipeline: formatting, tokenization, generation and decoding.
pub struct FidReader {
    model: FidT5,
    tokenizer: Tokenizer,
    collator: Collator,
    target_collator: Collator,
    sampler: Sampler,
    options: ReaderOptions,
    max_length: usize,
}

impl FidReader {
    /// Creates a reader from a loaded model and tokenizer.
    pub fn new(
        model: FidT5,
        tokenizer: Tokenizer,
        options: ReaderOptions,
        sampling: &SamplingConfig,
    ) -> Result<Self> {
        let pad_id = model.config().pad_token_id;
        let collator = Collator::new(&tokenizer, options.text_maxlength, pad_id)?;
        let target_collator = Collator::new(&tokenizer, options.answer_maxlength, pad_id)?;
        Ok(Self {
            model,
            tokenizer,
            collator,
            target_collator,
            sampler: Sampler::new(sampling),
            options,
            max_length: sampling.max_length,
        })
    }

    /// Loads a reader from a local checkpoint directory or a Hub model ID.
    ///
    /// # Arguments
    ///
    /// * `model` - Checkpoint directory or HuggingFace model ID (e.g., "t5-base")
    /// * `revision` - Hub revision
    /// * `tokenizer` - tokenizer.json to use when the checkpoint ships none
    pub fn from_pretrained(
        model: &str,
        revision: &str,
        tokenizer: Option<&Path>,
        device: &Device,
        dtype: DType,
        options: ReaderOptions,
        sampling: &SamplingConfig,
    ) -> Result<Self> {
        let files = resolve_model(model, revision)?;
        let config: ReaderConfig = load_config(&files.config)?;
        info!(
            model,
            d_model = config.d_model,
            layers = config.num_layers,
            "loading FiD reader"
        );

        let tokenizer_path = tokenizer
            .map(Path::to_path_buf)
            .or(files.tokenizer.clone())
            .ok_or_else(|| Error::ModelLoad(format!("no tokenizer.json for {model}")))?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| Error::Tokenization(e.to_string()))?;

        let vb: VarBuilder = load_weights(&files, dtype, device)?;
        let fid = FidT5::new(&config, vb)?;
        Self::new(fid, tokenizer, options, sampling)
    }

    /// Returns the model.
    pub fn model(&self) -> &FidT5 {
        &self.model
    }

    /// Returns the model, mutably.
    pub fn model_mut(&mut self) -> &mut FidT5 {
        &mut self.model
    }

    /// Returns the reader options.
    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    fn encode_examples(&self, examples: &[Example]) -> Result<(Tensor, Tensor)> {
        let texts: Vec<Vec<String>> = examples
            .iter()
            .map(|ex| ex.reader_texts(self.options.n_context))
            .collect();
        self.collator
            .encode_passages(&texts, self.model.device())
    }

    /// Answers a single question.
    pub fn answer(&mut self, example: &Example) -> Result<Answer> {
        let mut answers = self.answer_batch(std::slice::from_ref(example))?;
        answers
            .pop()
            .ok_or_else(|| Error::InvalidInput("no answer generated".into()))
    }

    /// Answers a batch of questions with the same number of passages.
    pub fn answer_batch(&mut self, examples: &[Example]) -> Result<Vec<Answer>> {
        let (input_ids, attention_mask) = self.encode_examples(examples)?;
        debug!(shape = ?input_ids.dims(), "encoded reader inputs");

        let with_scores = self.options.with_passage_scores;
        if with_scores {
            self.model.enable_score_storage();
            self.model.reset_score_storage();
        }

        let sampler = &mut self.sampler;
        let generated = self.model.generate_with(
            &input_ids,
            &attention_mask,
            self.max_length,
            |logits| sampler.sample(logits),
        )?;

        let passage_scores: Vec<Option<Vec<f32>>> = if with_scores {
            let scores = self.model.get_crossattention_scores(&attention_mask)?;
            self.model.reset_score_storage();
            scores.to_vec2::<f32>()?.into_iter().map(Some).collect()
        } else {
            vec![None; examples.len()]
        };

        generated
            .into_iter()
            .zip(passage_scores)
            .map(|(token_ids, passage_scores)| {
                let text = self
                    .tokenizer
                    .decode(&token_ids, true)
                    .map_err(|e| Error::Tokenization(e.to_string()))?;
                Ok(Answer {
                    text: text.trim().to_string(),
                    token_ids,
                    passage_scores,
                })
            })
            .collect()
    }

    /// Writes cross-attention passage scores into `ctxs[].score`.
    ///
    /// Only the first `n_context` passages of each example are scored.
    pub fn annotate_scores(&mut self, examples: &mut [Example]) -> Result<()> {
        let (input_ids, attention_mask) = self.encode_examples(examples)?;

        self.model.enable_score_storage();
        self.model.reset_score_storage();
        // One decoding step is enough: scores are taken at the first position.
        self.model.generate(&input_ids, &attention_mask, 2)?;
        let scores = self
            .model
            .get_crossattention_scores(&attention_mask)?
            .to_vec2::<f32>()?;
        self.model.reset_score_storage();

        for (example, scores) in examples.iter_mut().zip(scores) {
            for (passage, score) in example.ctxs.iter_mut().zip(scores) {
                passage.score = Some(score);
            }
        }
        Ok(())
    }

    /// Mean token cross-entropy of the examples' targets.
    pub fn loss(&mut self, examples: &[Example]) -> Result<f32> {
        let targets: Vec<String> = examples
            .iter()
            .map(|ex| {
                ex.target()
                    .map(str::to_string)
                    .ok_or_else(|| Error::InvalidInput(format!("no target for `{}`", ex.question)))
            })
            .collect::<Result<_>>()?;

        let (input_ids, attention_mask) = self.encode_examples(examples)?;
        let (target_ids, target_mask) = self
            .target_collator
            .encode(&targets, self.model.device())?;

        // Padding positions are excluded from the loss.
        let target_ids = target_ids.to_dtype(DType::I64)?;
        let ignored = Tensor::full(IGNORE_INDEX, target_ids.shape(), target_ids.device())?;
        let labels = target_mask.where_cond(&target_ids, &ignored)?;

        let output = self
            .model
            .forward(&input_ids, Some(&attention_mask), None, Some(&labels))?;
        let loss = output
            .loss
            .ok_or_else(|| Error::InvalidInput("labels produced no loss".into()))?;
        Ok(loss.to_scalar::<f32>()?)
    }
}
