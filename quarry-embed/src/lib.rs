//! # quarry-embed
//!
//! Text embeddings for the quarry indexing engine.
//!
//! ## Features
//!
//! - **Pluggable embedders**: the [`Embedder`] trait, with [`ModelEmbedder`]
//!   running any [`EmbeddingRuntime`] (fastembed ONNX models or deterministic
//!   feature hashing)
//! - **Adaptive batching**: runtime failures halve the batch size down to 1
//!   and emit a `batch_size_fallback` warning ([`BatchSizer`])
//! - **Worker isolation**: [`EmbedderWorker`] hosts an embedder on its own
//!   thread behind a typed request/response protocol
//! - **Registry**: [`EmbedderRegistry`] picks the highest-priority ready
//!   embedder as default
//! - **Asymmetric prefixes**: E5-style `query: ` / `passage: ` handling
//!
//! ## Quick Start
//!
//! ```
//! use quarry_embed::{EmbedConfig, Embedder, ModelEmbedder};
//!
//! # async fn example() -> quarry_embed::Result<()> {
//! let embedder = ModelEmbedder::new("local", EmbedConfig::hashed(64))?;
//! embedder.initialize().await?;
//! let query = embedder.embed_query("how do I configure logging").await?;
//! assert_eq!(query.len(), 64);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: model catalog, device and precision settings
//! - [`provider`]: the embedder trait and the runtime-backed implementation
//! - [`runtime`]: blocking inference backends
//! - [`batch`]: adaptive batch sizing
//! - [`registry`]: named embedders with default selection
//! - [`worker`]: thread-hosted embedders
//! - [`rpc`]: correlation ids and timeouts shared with the IPC layer
//! - [`sanitize`]: input cleanup

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
#[cfg(feature = "fastembed")]
pub mod fastembed_runtime;
pub mod provider;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod sanitize;
pub mod worker;

pub use batch::BatchSizer;
pub use config::{
    DEFAULT_MODEL, Device, DeviceConfig, EmbedConfig, MODEL_CATALOG, ModelInfo, Quantization,
    ResolvedDevice, RuntimeKind, model_info,
};
pub use error::{EmbedError, Result};
pub use events::EmbedderEvent;
pub use provider::{Embedder, EmbeddingDetails, ModelEmbedder, Prefixes};
pub use registry::EmbedderRegistry;
pub use rpc::{CallError, PendingCalls};
pub use runtime::{EmbeddingRuntime, HashRuntime, RuntimeFactory, l2_normalize};
pub use sanitize::clean_text;
pub use worker::{EmbedderWorker, WorkerReply, WorkerRequest};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_registry_with_worker_hosted_embedder() -> anyhow::Result<()> {
        let registry = EmbedderRegistry::new();
        let inner = Arc::new(ModelEmbedder::new("hash", EmbedConfig::hashed(16))?);
        let worker = EmbedderWorker::spawn(inner, Duration::from_secs(10))?;
        registry.register(Arc::new(worker));

        let embedder = registry.initialize_default().await?;
        assert_eq!(embedder.name(), "hash");
        let vector = embedder.embed_document("registry test").await?;
        assert_eq!(vector.len(), 16);

        registry.reset().await?;
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_clean_text_reexport() {
        assert_eq!(clean_text(" a\u{0000} b "), " a b ");
    }
}
