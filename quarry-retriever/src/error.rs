//! Error taxonomy for the indexing engine.
//!
//! Orchestration code returns `anyhow::Result` and wraps failures in one of
//! these variants where the caller needs to branch on the kind, for example
//! `err.downcast_ref::<QuarryError>()` to tell a fatal child failure from a
//! per-call error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuarryError {
    /// Unknown chunker, embedder or provider name, or a missing file.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Inconsistent options or malformed query syntax.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Embedding or OCR runtime error.
    #[error("Runtime failure: {0}")]
    RuntimeFailure(String),

    /// Filesystem or database error.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// Malformed or out-of-order IPC message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The child process reported an unrecoverable condition.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl QuarryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_option(message: impl Into<String>) -> Self {
        Self::InvalidOption(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidOption(_) => ErrorKind::InvalidOption,
            Self::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            Self::IoFailure(_) => ErrorKind::IoFailure,
            Self::ProtocolError(_) => ErrorKind::ProtocolError,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// The bare message, without the kind prefix of `Display`.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidOption(m)
            | Self::RuntimeFailure(m)
            | Self::IoFailure(m)
            | Self::ProtocolError(m)
            | Self::Fatal(m) => m,
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::InvalidOption => Self::InvalidOption(message),
            ErrorKind::RuntimeFailure => Self::RuntimeFailure(message),
            ErrorKind::IoFailure => Self::IoFailure(message),
            ErrorKind::ProtocolError => Self::ProtocolError(message),
            ErrorKind::Fatal => Self::Fatal(message),
        }
    }

    /// Classify an orchestration error; errors outside the taxonomy count as
    /// runtime failures.
    pub fn classify(err: &anyhow::Error) -> (ErrorKind, String) {
        match err.downcast_ref::<QuarryError>() {
            Some(e) if err.chain().count() == 1 => (e.kind(), e.message().to_string()),
            Some(e) => (e.kind(), format!("{err:#}")),
            None if err.downcast_ref::<sqlx::Error>().is_some() => (ErrorKind::IoFailure, format!("{err:#}")),
            None => (ErrorKind::RuntimeFailure, format!("{err:#}")),
        }
    }
}

/// Error kind as carried over the IPC wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidOption,
    RuntimeFailure,
    IoFailure,
    ProtocolError,
    Fatal,
}

impl From<quarry_chunk::ChunkError> for QuarryError {
    fn from(err: quarry_chunk::ChunkError) -> Self {
        match err {
            quarry_chunk::ChunkError::NotFound(name) => Self::NotFound(format!("chunker {name}")),
            quarry_chunk::ChunkError::InvalidOption(msg) => Self::InvalidOption(msg),
        }
    }
}

impl From<quarry_embed::EmbedError> for QuarryError {
    fn from(err: quarry_embed::EmbedError) -> Self {
        use quarry_embed::EmbedError as E;
        match err {
            E::NotFound { name } => Self::NotFound(format!("embedder {name}")),
            E::InvalidConfig { message } => Self::InvalidOption(message),
            E::Io { source } => Self::IoFailure(source.to_string()),
            other => Self::RuntimeFailure(other.to_string()),
        }
    }
}

impl From<std::io::Error> for QuarryError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::IoFailure(err.to_string())
        }
    }
}

impl From<sqlx::Error> for QuarryError {
    fn from(err: sqlx::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_kind() {
        let err: QuarryError = quarry_chunk::ChunkError::invalid_option("overlap").into();
        assert!(matches!(err, QuarryError::InvalidOption(_)));

        let err: QuarryError = quarry_embed::EmbedError::runtime("oom").into();
        assert!(matches!(err, QuarryError::RuntimeFailure(_)));

        let err: QuarryError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, QuarryError::NotFound(_)));
    }

    #[test]
    fn test_kind_round_trip() {
        let err = QuarryError::not_found("chunker nope");
        let back = QuarryError::from_kind(err.kind(), err.message());
        assert!(matches!(back, QuarryError::NotFound(ref m) if m == "chunker nope"));

        let wrapped = anyhow::Error::new(QuarryError::invalid_option("bad")).context("while searching");
        let (kind, message) = QuarryError::classify(&wrapped);
        assert_eq!(kind, ErrorKind::InvalidOption);
        assert!(message.starts_with("while searching"));
        assert_eq!(QuarryError::classify(&anyhow::anyhow!("boom")).0, ErrorKind::RuntimeFailure);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err = anyhow::Error::new(QuarryError::Fatal("out of memory".into()));
        let kind = err.downcast_ref::<QuarryError>().unwrap();
        assert!(kind.is_fatal());
    }
}
