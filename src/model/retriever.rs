//! Dual-encoder passage retriever.
//!
//! Questions and passages are embedded independently by the same BERT
//! encoder (optionally followed by a projection and LayerNorm). A passage is
//! scored by the scaled dot product of its vector with the question vector.
//! The retriever is trained to match a target distribution over passages,
//! typically the reader's aggregated cross-attention scores.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use super::bert::BertModel;
use crate::config::RetrieverConfig;

/// Output of [`Retriever::forward`].
#[derive(Debug, Clone)]
pub struct RetrieverOutput {
    /// Question vectors [batch, dim].
    pub question_output: Tensor,
    /// Passage vectors [batch * n_passages, dim].
    pub passage_output: Tensor,
    /// Relevance scores [batch, n_passages].
    pub score: Tensor,
    /// KL divergence to the gold scores, when given.
    pub loss: Option<Tensor>,
}

/// BERT dual encoder with optional projection.
#[derive(Debug, Clone)]
pub struct Retriever {
    model: BertModel,
    projection: Option<(Linear, LayerNorm)>,
    config: RetrieverConfig,
}

impl Retriever {
    /// Builds a retriever from weights named `model.*`, `proj.*` and `norm.*`.
    pub fn new(config: &RetrieverConfig, vb: VarBuilder) -> Result<Self> {
        Self::build(config, vb.pp("model"), vb)
    }

    /// Starts a retriever from a stock BERT checkpoint.
    ///
    /// `bert_vb` covers the checkpoint root; its tensors may live under
    /// `bert.*` (`BertForPreTraining` exports) or directly at
    /// `embeddings.*` / `encoder.*`. The projection head is read from
    /// `head_vb`, normally backed by a fresh `VarMap` so that `proj` and
    /// `norm` start from their default initialization.
    pub fn from_bert(
        config: &RetrieverConfig,
        bert_vb: VarBuilder,
        head_vb: VarBuilder,
    ) -> Result<Self> {
        let bert_vb = if bert_vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            bert_vb.pp("bert")
        } else {
            bert_vb
        };
        Self::build(config, bert_vb, head_vb)
    }

    fn build(config: &RetrieverConfig, bert_vb: VarBuilder, head_vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let model = BertModel::new(config, bert_vb)?;
        let projection = if config.projection {
            let proj = linear(
                config.hidden_size,
                config.indexing_dimension,
                head_vb.pp("proj"),
            )?;
            // nn.LayerNorm default epsilon
            let norm = layer_norm(config.indexing_dimension, 1e-5, head_vb.pp("norm"))?;
            Some((proj, norm))
        } else {
            None
        };

        Ok(Self {
            model,
            projection,
            config: config.clone(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Returns the BERT encoder.
    pub fn bert(&self) -> &BertModel {
        &self.model
    }

    /// Whether a projection head follows BERT.
    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    /// Embeds a batch of texts.
    ///
    /// # Arguments
    ///
    /// * `text_ids` - Token IDs [batch, len]
    /// * `text_mask` - 0/1 mask [batch, len]
    /// * `apply_mask` - Pass the mask to BERT and pool over real tokens only
    /// * `extract_cls` - Use the first token instead of mean pooling
    ///
    /// # Returns
    ///
    /// Text vectors [batch, dim]
    pub fn embed_text(
        &self,
        text_ids: &Tensor,
        text_mask: &Tensor,
        apply_mask: bool,
        extract_cls: bool,
    ) -> Result<Tensor> {
        let hidden = self
            .model
            .forward(text_ids, apply_mask.then_some(text_mask))?;
        let hidden = match &self.projection {
            Some((proj, norm)) => norm.forward(&proj.forward(&hidden)?)?,
            None => hidden,
        };

        if extract_cls {
            return hidden.narrow(1, 0, 1)?.squeeze(1);
        }
        if apply_mask {
            let mask = text_mask.to_dtype(hidden.dtype())?;
            let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
            let counts = mask.sum_keepdim(1)?;
            summed.broadcast_div(&counts)
        } else {
            hidden.mean(1)
        }
    }

    /// Scores passages against their question.
    ///
    /// # Arguments
    ///
    /// * `question_ids` / `question_mask` - [batch, question_len]
    /// * `passage_ids` / `passage_mask` - [batch, n_passages, passage_len]
    /// * `gold_score` - Optional target scores [batch, n_passages]
    pub fn forward(
        &self,
        question_ids: &Tensor,
        question_mask: &Tensor,
        passage_ids: &Tensor,
        passage_mask: &Tensor,
        gold_score: Option<&Tensor>,
    ) -> Result<RetrieverOutput> {
        let question_output = self.embed_text(
            question_ids,
            question_mask,
            self.config.apply_question_mask,
            self.config.extract_cls,
        )?;

        let (batch_size, n_passages, passage_len) = passage_ids.dims3()?;
        let passage_ids = passage_ids.reshape((batch_size * n_passages, passage_len))?;
        let passage_mask = passage_mask.reshape((batch_size * n_passages, passage_len))?;
        let passage_output = self.embed_text(
            &passage_ids,
            &passage_mask,
            self.config.apply_passage_mask,
            self.config.extract_cls,
        )?;

        let dim = question_output.dim(D::Minus1)?;
        // einsum('bd,bid->bi')
        let score = passage_output
            .reshape((batch_size, n_passages, dim))?
            .matmul(&question_output.unsqueeze(2)?)?
            .squeeze(2)?;
        let score = (score / (dim as f64).sqrt())?;

        let loss = gold_score
            .map(|gold| Self::kldivloss(&score, gold))
            .transpose()?;

        Ok(RetrieverOutput {
            question_output,
            passage_output,
            score,
            loss,
        })
    }

    /// KL divergence between `softmax(gold_score)` and `softmax(score)`,
    /// averaged over every element.
    pub fn kldivloss(score: &Tensor, gold_score: &Tensor) -> Result<Tensor> {
        let score = score.to_dtype(DType::F32)?;
        let gold_score = gold_score.to_dtype(DType::F32)?;

        let target = candle_nn::ops::softmax(&gold_score, D::Minus1)?;
        let log_target = candle_nn::ops::log_softmax(&gold_score, D::Minus1)?;
        let log_pred = candle_nn::ops::log_softmax(&score, D::Minus1)?;

        let pointwise = (&target * (log_target - log_pred)?)?;
        // 0 * ln 0 counts as 0
        let positive = target.gt(&target.zeros_like()?)?;
        let pointwise = positive.where_cond(&pointwise, &pointwise.zeros_like()?)?;
        pointwise.mean_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_validate_runs_on_construction() {
        let config = RetrieverConfig {
            projection: false,
            indexing_dimension: 128,
            ..RetrieverConfig::default()
        };
        let result = Retriever::new(&config, VarBuilder::zeros(DType::F32, &Device::Cpu));
        assert!(result.is_err());
    }

    #[test]
    fn test_kldivloss_zero_for_matching_scores() {
        let device = Device::Cpu;
        let score = Tensor::new(&[[0.5f32, 1.5, -2.0]], &device).unwrap();
        let loss: f32 = Retriever::kldivloss(&score, &score)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(loss.abs() < 1e-6);
    }

    #[test]
    fn test_kldivloss_known_value() {
        let device = Device::Cpu;
        // Uniform prediction against a two-way gold distribution.
        let score = Tensor::new(&[[0f32, 0.0]], &device).unwrap();
        let gold = Tensor::new(&[[0f32, 2f32.ln()]], &device).unwrap();
        let loss: f32 = Retriever::kldivloss(&score, &gold)
            .unwrap()
            .to_scalar()
            .unwrap();

        // p = [1/3, 2/3], q = [1/2, 1/2]
        let p = [1.0f32 / 3.0, 2.0 / 3.0];
        let expected = p.iter().map(|&pi| pi * (pi / 0.5).ln()).sum::<f32>() / 2.0;
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_clone_shares_weights() {
        let device = Device::Cpu;
        let config = RetrieverConfig {
            vocab_size: 30,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            indexing_dimension: 4,
            ..RetrieverConfig::default()
        };
        let varmap = candle_nn::VarMap::new();
        let retriever =
            Retriever::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, &device)).unwrap();
        let copy = retriever.clone();
        assert!(format!("{copy:?}").contains("Retriever"));

        let ids = Tensor::new(&[[1u32, 2, 3]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1]], &device).unwrap();
        let a: Vec<f32> = retriever
            .embed_text(&ids, &mask, false, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = copy
            .embed_text(&ids, &mask, false, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }
}
