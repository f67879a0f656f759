//! Passage ranking with the dual-encoder retriever.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::RetrieverConfig;
use crate::data::{Collator, Example, Passage};
use crate::error::{Error, Result};
use crate::model::{load_config, load_weights, resolve_model, ModelFiles, Retriever};

/// A passage and its retriever score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPassage {
    /// Index of the passage in the example's `ctxs`.
    pub index: usize,
    /// Scaled dot-product score.
    pub score: f32,
}

/// Scores, ranks and embeds passages with a [`Retriever`].
pub struct PassageRanker {
    retriever: Retriever,
    question_collator: Collator,
    passage_collator: Collator,
    device: Device,
}

impl PassageRanker {
    /// Creates a ranker from a loaded retriever and its tokenizer.
    pub fn new(retriever: Retriever, tokenizer: &Tokenizer, device: &Device) -> Result<Self> {
        let config = retriever.config();
        let pad_id = tokenizer.token_to_id("[PAD]").unwrap_or(0);
        let question_collator = Collator::new(tokenizer, config.question_maxlength, pad_id)?;
        let passage_collator = Collator::new(tokenizer, config.passage_maxlength, pad_id)?;
        Ok(Self {
            retriever,
            question_collator,
            passage_collator,
            device: device.clone(),
        })
    }

    /// Loads a retriever from a local checkpoint directory or a Hub model ID.
    ///
    /// FiD retriever checkpoints ship no tokenizer; pass the BERT one
    /// (`bert-base-uncased`) through `tokenizer`.
    pub fn from_pretrained(
        model: &str,
        revision: &str,
        tokenizer: Option<&Path>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (files, config, tokenizer) = Self::resolve(model, revision, tokenizer)?;
        let vb = load_weights(&files, dtype, device)?;
        let retriever = Retriever::new(&config, vb)?;
        Self::new(retriever, &tokenizer, device)
    }

    /// Starts an untrained retriever from a stock BERT checkpoint
    /// (e.g. `bert-base-uncased`).
    ///
    /// The BERT tower takes the checkpoint weights. When projection is
    /// enabled, `proj` and `norm` are freshly initialized.
    pub fn from_bert(
        model: &str,
        revision: &str,
        tokenizer: Option<&Path>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (files, config, tokenizer) = Self::resolve(model, revision, tokenizer)?;
        let bert_vb = load_weights(&files, dtype, device)?;
        let head = VarMap::new();
        let head_vb = VarBuilder::from_varmap(&head, dtype, device);
        let retriever = Retriever::from_bert(&config, bert_vb, head_vb)?;
        debug!(
            projection = retriever.has_projection(),
            "initialized retriever from BERT"
        );
        Self::new(retriever, &tokenizer, device)
    }

    fn resolve(
        model: &str,
        revision: &str,
        tokenizer: Option<&Path>,
    ) -> Result<(ModelFiles, RetrieverConfig, Tokenizer)> {
        let files = resolve_model(model, revision)?;
        let config: RetrieverConfig = load_config(&files.config)?;
        config.validate()?;
        info!(
            model,
            hidden = config.hidden_size,
            dim = config.output_dim(),
            "loading retriever"
        );

        let tokenizer_path = tokenizer
            .map(Path::to_path_buf)
            .or(files.tokenizer.clone())
            .ok_or_else(|| Error::ModelLoad(format!("no tokenizer.json for {model}")))?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok((files, config, tokenizer))
    }

    /// Returns the retriever.
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    fn encode(&self, example: &Example, n_context: Option<usize>) -> Result<[Tensor; 4]> {
        let passages = example.retriever_texts(n_context);
        if passages.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no passages to rank for `{}`",
                example.question
            )));
        }
        let (question_ids, question_mask) = self
            .question_collator
            .encode(std::slice::from_ref(&example.question), &self.device)?;
        let (passage_ids, passage_mask) = self
            .passage_collator
            .encode_passages(&[passages], &self.device)?;
        Ok([question_ids, question_mask, passage_ids, passage_mask])
    }

    /// Scores the first `n_context` passages of an example.
    pub fn score(&self, example: &Example, n_context: Option<usize>) -> Result<Vec<f32>> {
        let [question_ids, question_mask, passage_ids, passage_mask] =
            self.encode(example, n_context)?;
        let output = self.retriever.forward(
            &question_ids,
            &question_mask,
            &passage_ids,
            &passage_mask,
            None,
        )?;
        Ok(output.score.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()?)
    }

    /// Ranks passages by descending score.
    pub fn rank(&self, example: &Example, n_context: Option<usize>) -> Result<Vec<RankedPassage>> {
        let mut ranked: Vec<RankedPassage> = self
            .score(example, n_context)?
            .into_iter()
            .enumerate()
            .map(|(index, score)| RankedPassage { index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        debug!(question = %example.question, passages = ranked.len(), "ranked passages");
        Ok(ranked)
    }

    /// Replaces the example's passages by the ranked ones, with scores.
    pub fn rerank(&self, example: &mut Example, n_context: Option<usize>) -> Result<()> {
        let ranked = self.rank(example, n_context)?;
        let reordered: Vec<Passage> = ranked
            .iter()
            .map(|r| Passage {
                score: Some(r.score),
                ..example.ctxs[r.index].clone()
            })
            .collect();
        example.ctxs = reordered;
        Ok(())
    }

    /// KL divergence between retriever scores and the passages' stored scores.
    ///
    /// The stored scores are typically the reader's cross-attention scores.
    pub fn distillation_loss(&self, example: &Example, n_context: Option<usize>) -> Result<f32> {
        let gold: Vec<f32> = example
            .contexts(n_context)
            .iter()
            .map(|p| {
                p.score.ok_or_else(|| {
                    Error::InvalidInput(format!("passage `{}` has no gold score", p.title))
                })
            })
            .collect::<Result<_>>()?;
        let gold = Tensor::from_vec(gold.clone(), (1, gold.len()), &self.device)?;

        let [question_ids, question_mask, passage_ids, passage_mask] =
            self.encode(example, n_context)?;
        let output = self.retriever.forward(
            &question_ids,
            &question_mask,
            &passage_ids,
            &passage_mask,
            Some(&gold),
        )?;
        let loss = output
            .loss
            .ok_or_else(|| Error::InvalidInput("gold scores produced no loss".into()))?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Embeds passages for indexing.
    ///
    /// # Returns
    ///
    /// Passage vectors [passages.len(), dim]
    pub fn embed_passages(&self, passages: &[Passage], batch_size: usize) -> Result<Tensor> {
        let config = self.retriever.config();
        let texts: Vec<String> = passages.iter().map(Passage::retriever_text).collect();
        let mut chunks = Vec::new();
        for batch in texts.chunks(batch_size.max(1)) {
            let (ids, mask) = self.passage_collator.encode(batch, &self.device)?;
            chunks.push(self.retriever.embed_text(
                &ids,
                &mask,
                config.apply_passage_mask,
                config.extract_cls,
            )?);
        }
        if chunks.is_empty() {
            return Err(Error::InvalidInput("no passages to embed".into()));
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }

    /// Embeds questions for search.
    pub fn embed_questions(&self, questions: &[String]) -> Result<Tensor> {
        let config = self.retriever.config();
        let (ids, mask) = self.question_collator.encode(questions, &self.device)?;
        Ok(self
            .retriever
            .embed_text(&ids, &mask, config.apply_question_mask, config.extract_cls)?)
    }
}
