use thiserror::Error;

/// Errors produced while configuring or running chunkers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// No chunker is registered under the requested name.
    #[error("Chunker not found: {0}")]
    NotFound(String),

    /// Chunking options are inconsistent (e.g. overlap not smaller than the chunk size).
    #[error("Invalid chunk option: {0}")]
    InvalidOption(String),
}

impl ChunkError {
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound(name.into())
    }

    pub fn invalid_option<S: Into<String>>(message: S) -> Self {
        Self::InvalidOption(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ChunkError>;
