//! Error types for fid-rs.

use thiserror::Error;

/// Result type alias for fid-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fid-rs.
#[derive(Error, Debug)]
pub enum Error {
    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied data does not fit the model's input contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
