//! Model loading utilities.
//!
//! This module provides functions for:
//! - Resolving model files from the HuggingFace Hub or a local directory
//! - Building a VarBuilder over SafeTensors (or PyTorch `.bin`) weights
//! - Parsing `config.json` into the reader or retriever configuration

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, api::sync::ApiRepo, Repo, RepoType};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Error, Result};

const SAFETENSORS: &str = "model.safetensors";
const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const PYTORCH_BIN: &str = "pytorch_model.bin";

/// Paths to model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors shards or a single `.bin`).
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json, when the repository ships one.
    pub tokenizer: Option<PathBuf>,
}

impl ModelFiles {
    /// Collects model files from a local checkpoint directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = dir.join("config.json");
        if !config.is_file() {
            return Err(Error::ModelLoad(format!(
                "no config.json in {}",
                dir.display()
            )));
        }

        let weights = if dir.join(SAFETENSORS).is_file() {
            vec![dir.join(SAFETENSORS)]
        } else if dir.join(SAFETENSORS_INDEX).is_file() {
            shard_names(&dir.join(SAFETENSORS_INDEX))?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else if dir.join(PYTORCH_BIN).is_file() {
            vec![dir.join(PYTORCH_BIN)]
        } else {
            return Err(Error::ModelLoad(format!(
                "no weights found in {}",
                dir.display()
            )));
        };

        let tokenizer = Some(dir.join("tokenizer.json")).filter(|p| p.is_file());
        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    /// Whether the weights are a PyTorch pickle rather than SafeTensors.
    pub fn is_pytorch(&self) -> bool {
        self.weights
            .first()
            .is_some_and(|p| p.extension().is_some_and(|ext| ext == "bin"))
    }
}

/// Resolves model files from a local directory or the HuggingFace Hub.
///
/// # Arguments
///
/// * `model` - Local checkpoint directory or HuggingFace model ID (e.g., "t5-base")
/// * `revision` - Git revision used for Hub downloads
pub fn resolve_model(model: &str, revision: &str) -> Result<ModelFiles> {
    let path = Path::new(model);
    if path.is_dir() {
        debug!(dir = %path.display(), "loading model from local directory");
        ModelFiles::from_dir(path)
    } else {
        download_model(model, revision)
    }
}

/// Downloads model files from HuggingFace Hub.
///
/// # Arguments
///
/// * `model_id` - HuggingFace model ID (e.g., "t5-base")
/// * `revision` - Git revision (branch, tag, or commit hash). Use "main" for latest.
///
/// # Returns
///
/// Paths to downloaded files: (config.json, model weights, tokenizer file)
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("Failed to create HF API: {e}")))?;

    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    info!(model_id, revision, "downloading model files");

    let config = repo
        .get("config.json")
        .map_err(|e| Error::ModelLoad(format!("Failed to download config.json: {e}")))?;
    let weights = download_weights(&repo)?;
    // Older checkpoints only ship spiece.model / vocab.txt.
    let tokenizer = repo.get("tokenizer.json").ok();

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}

/// Downloads model weight files, preferring SafeTensors.
fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get(SAFETENSORS) {
        return Ok(vec![path]);
    }

    if let Ok(index_path) = repo.get(SAFETENSORS_INDEX) {
        let mut paths = Vec::new();
        for filename in shard_names(&index_path)? {
            let path = repo
                .get(&filename)
                .map_err(|e| Error::ModelLoad(format!("Failed to download {filename}: {e}")))?;
            paths.push(path);
        }
        return Ok(paths);
    }

    repo.get(PYTORCH_BIN)
        .map(|path| vec![path])
        .map_err(|e| Error::ModelLoad(format!("No SafeTensors or {PYTORCH_BIN} weights found: {e}")))
}

/// Lists the unique shard files of a SafeTensors index.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value = serde_json::from_str(&content)?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| Error::ModelLoad("Invalid safetensors index: missing weight_map".into()))?;

    let mut shards: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Creates a VarBuilder over the weight files.
///
/// # Safety
///
/// SafeTensors are memory-mapped. This is safe as long as the files are not
/// modified while being read.
#[allow(unsafe_code)]
pub fn load_weights(files: &ModelFiles, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    if files.is_pytorch() {
        let path = &files.weights[0];
        debug!(path = %path.display(), "loading PyTorch weights");
        return Ok(VarBuilder::from_pth(path, dtype, device)?);
    }
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
    Ok(vb)
}

/// Parses a `config.json` into a reader or retriever configuration.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("Failed to parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReaderConfig, RetrieverConfig};

    #[test]
    fn test_from_dir_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_from_dir_falls_back_to_pytorch_bin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join(PYTORCH_BIN), b"").unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(files.is_pytorch());
        assert!(files.tokenizer.is_none());
    }

    #[test]
    fn test_from_dir_reads_shard_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join(SAFETENSORS_INDEX),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(!files.is_pytorch());
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_load_config_generic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"vocab_size": 100, "d_model": 32, "d_kv": 8, "d_ff": 64, "num_layers": 2, "num_heads": 4}"#,
        )
        .unwrap();
        let reader: ReaderConfig = load_config(&path).unwrap();
        assert_eq!(reader.d_model, 32);
        assert!(reader.passage_position_embedding);

        std::fs::write(&path, r#"{"hidden_size": 64, "indexing_dimension": 32}"#).unwrap();
        let retriever: RetrieverConfig = load_config(&path).unwrap();
        assert_eq!(retriever.hidden_size, 64);
        assert!(retriever.projection);
    }
}
