//! FiD data format and batch collation.
//!
//! Examples are stored as a JSON array (or JSON lines) of records:
//!
//! ```json
//! {
//!   "id": "0",
//!   "question": "where is the eiffel tower",
//!   "answers": ["Paris"],
//!   "ctxs": [{"title": "Eiffel Tower", "text": "The Eiffel Tower is ...", "score": 0.8}]
//! }
//! ```
//!
//! The reader sees each passage as `question: {q} title: {t} context: {c}`;
//! the retriever embeds passages as `{title} {text}`.

use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::error::{Error, Result};

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Passage identifier in the corpus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Title of the source document.
    #[serde(default)]
    pub title: String,
    /// Passage body.
    pub text: String,
    /// Relevance score (retriever or cross-attention).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Passage {
    /// Text seen by the reader.
    pub fn reader_text(&self, question: &str) -> String {
        format!("question: {question} title: {} context: {}", self.title, self.text)
    }

    /// Text embedded by the retriever.
    pub fn retriever_text(&self) -> String {
        format!("{} {}", self.title, self.text)
    }
}

/// A question with its retrieved passages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Example identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Question text.
    pub question: String,
    /// Reference answers.
    #[serde(default)]
    pub answers: Vec<String>,
    /// Training target; the first answer is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Retrieved passages, best first.
    #[serde(default)]
    pub ctxs: Vec<Passage>,
}

impl Example {
    /// Training target.
    pub fn target(&self) -> Option<&str> {
        self.target
            .as_deref()
            .or_else(|| self.answers.first().map(String::as_str))
    }

    /// The first `n_context` passages (all when `None`).
    pub fn contexts(&self, n_context: Option<usize>) -> &[Passage] {
        let n = n_context.map_or(self.ctxs.len(), |n| n.min(self.ctxs.len()));
        &self.ctxs[..n]
    }

    /// Reader inputs, one per passage.
    ///
    /// An example without passages yields the bare question.
    pub fn reader_texts(&self, n_context: Option<usize>) -> Vec<String> {
        let contexts = self.contexts(n_context);
        if contexts.is_empty() {
            return vec![format!("question: {}", self.question)];
        }
        contexts
            .iter()
            .map(|p| p.reader_text(&self.question))
            .collect()
    }

    /// Retriever passage inputs, one per passage.
    pub fn retriever_texts(&self, n_context: Option<usize>) -> Vec<String> {
        self.contexts(n_context)
            .iter()
            .map(Passage::retriever_text)
            .collect()
    }
}

/// Loads examples from a JSON array or a JSON-lines file.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

/// Writes examples as a pretty-printed JSON array.
pub fn save_examples(path: impl AsRef<Path>, examples: &[Example]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), examples)?;
    Ok(())
}

/// Tokenizes texts into fixed-length id and mask tensors.
#[derive(Clone)]
pub struct Collator {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl Collator {
    /// Wraps a tokenizer; every sequence is truncated and padded to `max_length`.
    pub fn new(tokenizer: &Tokenizer, max_length: usize, pad_id: u32) -> Result<Self> {
        if max_length == 0 {
            return Err(Error::InvalidInput("max_length must be positive".into()));
        }
        let mut tokenizer = tokenizer.clone();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            pad_id,
            ..Default::default()
        }));
        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    /// Sequence length of every encoded text.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Tokenizes texts.
    ///
    /// # Returns
    ///
    /// `(ids, mask)`, both u32 [texts.len(), max_length]
    pub fn encode(&self, texts: &[String], device: &Device) -> Result<(Tensor, Tensor)> {
        if texts.is_empty() {
            return Err(Error::InvalidInput("nothing to encode".into()));
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;

        let n = encodings.len();
        let mut ids = Vec::with_capacity(n * self.max_length);
        let mut mask = Vec::with_capacity(n * self.max_length);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }
        let ids = Tensor::from_vec(ids, (n, self.max_length), device)?;
        let mask = Tensor::from_vec(mask, (n, self.max_length), device)?;
        Ok((ids, mask))
    }

    /// Tokenizes the passages of several examples.
    ///
    /// # Arguments
    ///
    /// * `batch` - One list of passage texts per example; all lists have the same length
    ///
    /// # Returns
    ///
    /// `(ids, mask)`, both u32 [batch, n_passages, max_length]
    pub fn encode_passages(
        &self,
        batch: &[Vec<String>],
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let n_passages = batch
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::InvalidInput("empty batch".into()))?;
        if let Some(other) = batch.iter().find(|texts| texts.len() != n_passages) {
            return Err(Error::InvalidInput(format!(
                "examples in a batch must have the same number of passages ({n_passages} vs {})",
                other.len()
            )));
        }

        let flat: Vec<String> = batch.iter().flatten().cloned().collect();
        let (ids, mask) = self.encode(&flat, device)?;
        let shape = (batch.len(), n_passages, self.max_length);
        Ok((ids.reshape(shape)?, mask.reshape(shape)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> Example {
        serde_json::from_str(
            r#"{
                "id": 7,
                "question": "who wrote hamlet",
                "answers": ["Shakespeare", "William Shakespeare"],
                "ctxs": [
                    {"title": "Hamlet", "text": "Hamlet is a tragedy.", "score": 1.5},
                    {"title": "Globe", "text": "A theatre in London."}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_reader_text_format() {
        let ex = example();
        assert_eq!(
            ex.reader_texts(None),
            vec![
                "question: who wrote hamlet title: Hamlet context: Hamlet is a tragedy.".to_string(),
                "question: who wrote hamlet title: Globe context: A theatre in London.".to_string(),
            ]
        );
        assert_eq!(ex.retriever_texts(Some(1)), vec!["Hamlet Hamlet is a tragedy.".to_string()]);
    }

    #[test]
    fn test_target_defaults_to_first_answer() {
        let mut ex = example();
        assert_eq!(ex.target(), Some("Shakespeare"));
        ex.target = Some("W. Shakespeare".into());
        assert_eq!(ex.target(), Some("W. Shakespeare"));
    }

    #[test]
    fn test_no_passages_uses_question_only() {
        let mut ex = example();
        ex.ctxs.clear();
        assert_eq!(ex.reader_texts(Some(5)), vec!["question: who wrote hamlet".to_string()]);
    }

    #[test]
    fn test_n_context_is_clamped() {
        let ex = example();
        assert_eq!(ex.contexts(Some(10)).len(), 2);
        assert_eq!(ex.contexts(Some(1)).len(), 1);
    }
}
