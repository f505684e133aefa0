//! Error types for training and generation.
//!
//! Everything that can go wrong because of a caller's input (configuration,
//! context length, token ids, files on disk) is reported through [`Error`].
//! Shape mismatches *inside* the tensor code are programming defects and stay
//! assertions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sequence length {len} exceeds block size {block_size}")]
    ContextTooLong { len: usize, block_size: usize },

    #[error("token id {token} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("invalid input shape: {0}")]
    Shape(String),

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
