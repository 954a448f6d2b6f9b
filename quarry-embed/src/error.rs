//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// `RuntimeFailure` is the recoverable class: the adaptive batch fallback
/// retries it with smaller batches before giving up. Everything else is
/// surfaced to the caller immediately.
///
/// # Error Categories
///
/// - **Lookup Errors**: unknown embedder or model names
/// - **Configuration Errors**: invalid settings, dimension mismatches
/// - **Initialization Errors**: failures during model loading
/// - **Runtime Errors**: the inference runtime rejected or failed a batch
/// - **Transport Errors**: worker thread gone or a call timed out
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// No embedder or model registered under this name
    #[error("Embedder not found: {name}")]
    NotFound { name: String },

    /// Error when embedder configuration is invalid
    #[error("Invalid embedder configuration: {message}")]
    InvalidConfig { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The inference runtime failed on a batch
    #[error("Embedding runtime failure: {message}")]
    RuntimeFailure { message: String },

    /// A request to the embedding worker did not complete in time
    #[error("Embedding call '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The embedding worker thread has shut down
    #[error("Embedding worker is closed")]
    WorkerClosed,

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create a runtime failure, the error class the batch fallback retries.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::RuntimeFailure {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Whether retrying with a smaller batch might succeed.
    pub fn is_runtime_failure(&self) -> bool {
        matches!(self, Self::RuntimeFailure { .. })
    }
}
