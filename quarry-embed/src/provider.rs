//! The embedder interface and the model-backed implementation.

use crate::batch::BatchSizer;
use crate::config::{EmbedConfig, ModelInfo, model_info};
use crate::error::{EmbedError, Result};
use crate::events::EmbedderEvent;
use crate::runtime::{EmbeddingRuntime, RuntimeFactory, factory_for};
use crate::sanitize::clean_text;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, broadcast};

/// A vector together with the facts needed to store it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingDetails {
    pub embedding: Vec<f32>,
    pub model_id: String,
    pub dimensions: usize,
    /// Rough token estimate of the input (characters / 4).
    pub token_count: usize,
}

/// Trait for components that turn text into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn max_tokens(&self) -> usize;

    fn is_multilingual(&self) -> bool;

    /// Higher wins when a registry picks its default.
    fn priority(&self) -> i32;

    /// Load the model. Calling it again on a ready embedder is a no-op.
    async fn initialize(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query, applying the model's query prefix.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a passage, applying the model's document prefix.
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_with_details(&self, text: &str) -> Result<EmbeddingDetails> {
        let embedding = self.embed(text).await?;
        Ok(EmbeddingDetails {
            dimensions: embedding.len(),
            embedding,
            model_id: self.model_id().to_string(),
            token_count: text.chars().count().div_ceil(4),
        })
    }

    /// Batch size currently used by the adaptive fallback.
    fn current_batch_size(&self) -> usize;

    /// Restore the configured batch size.
    fn reset_batch_size(&self);

    /// Progress and warning notifications.
    fn subscribe(&self) -> broadcast::Receiver<EmbedderEvent>;

    /// Release the model. The embedder may be initialized again later.
    async fn dispose(&self) -> Result<()>;
}

/// Query and passage prefixes for asymmetric retrieval models.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub query: String,
    pub passage: String,
}

impl Prefixes {
    pub fn for_model(model_id: &str) -> Self {
        if ModelInfo::uses_e5_prefixes(model_id) {
            Self {
                query: "query: ".to_string(),
                passage: "passage: ".to_string(),
            }
        } else {
            Self::default()
        }
    }
}

/// An [`Embedder`] backed by an [`EmbeddingRuntime`].
///
/// Inputs are sanitized with [`clean_text`], batched through a [`BatchSizer`]
/// and run on tokio's blocking pool. The runtime is loaded on first use if
/// [`Embedder::initialize`] was not called.
pub struct ModelEmbedder {
    name: String,
    config: EmbedConfig,
    dimensions: usize,
    max_tokens: usize,
    multilingual: bool,
    prefixes: Prefixes,
    factory: Arc<dyn RuntimeFactory>,
    runtime: RwLock<Option<Arc<dyn EmbeddingRuntime>>>,
    init_lock: Mutex<()>,
    sizer: BatchSizer,
    events: broadcast::Sender<EmbedderEvent>,
}

impl std::fmt::Debug for ModelEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEmbedder")
            .field("name", &self.name)
            .field("model", &self.config.model)
            .field("dimensions", &self.dimensions)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ModelEmbedder {
    /// Create an uninitialized embedder for `config`, using the runtime its
    /// [`RuntimeKind`](crate::RuntimeKind) selects.
    pub fn new(name: impl Into<String>, config: EmbedConfig) -> Result<Self> {
        let factory = factory_for(config.runtime)?;
        Self::with_factory(name, config, factory)
    }

    /// Create an embedder with an explicit runtime factory.
    pub fn with_factory(
        name: impl Into<String>,
        config: EmbedConfig,
        factory: Arc<dyn RuntimeFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let dimensions = config.resolved_dimensions()?;
        let info = model_info(&config.model);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            name: name.into(),
            dimensions,
            max_tokens: info.map(|i| i.max_tokens).unwrap_or(512),
            multilingual: info.map(|i| i.multilingual).unwrap_or(false),
            prefixes: Prefixes::for_model(&config.model),
            sizer: BatchSizer::new(config.batch_size),
            config,
            factory,
            runtime: RwLock::new(None),
            init_lock: Mutex::new(()),
            events,
        })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    fn loaded(&self) -> Option<Arc<dyn EmbeddingRuntime>> {
        self.runtime
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn progress(&self, stage: &str, progress: f32, message: String) {
        let _ = self.events.send(EmbedderEvent::Progress {
            embedder: self.name.clone(),
            stage: stage.to_string(),
            progress,
            message,
        });
    }

    async fn runtime(&self) -> Result<Arc<dyn EmbeddingRuntime>> {
        if let Some(runtime) = self.loaded() {
            return Ok(runtime);
        }
        self.initialize().await?;
        self.loaded()
            .ok_or_else(|| EmbedError::invalid_config("embedder failed to initialize"))
    }

    async fn run_batch(
        runtime: Arc<dyn EmbeddingRuntime>,
        batch: Vec<String>,
        dimensions: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let expected = batch.len();
        let vectors = tokio::task::spawn_blocking(move || runtime.embed(&batch)).await??;
        if vectors.len() != expected {
            return Err(EmbedError::runtime(format!(
                "runtime returned {} vectors for {} inputs",
                vectors.len(),
                expected
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(EmbedError::invalid_config(format!(
                "runtime produced {} dimensions, expected {}",
                bad.len(),
                dimensions
            )));
        }
        Ok(vectors)
    }

    fn with_prefix(prefix: &str, texts: &[String]) -> Vec<String> {
        texts.iter().map(|t| format!("{prefix}{t}")).collect()
    }
}

#[async_trait]
impl Embedder for ModelEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.loaded().is_some() {
            return Ok(());
        }

        let device = self.config.device.resolve(self.factory.gpu_available());
        tracing::info!(
            embedder = %self.name,
            model = %self.config.model,
            dimensions = self.dimensions,
            "Initializing embedder"
        );
        self.progress("loading", 0.0, format!("Loading {}", self.config.model));

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let runtime = tokio::task::spawn_blocking(move || factory.load(&config, device)).await??;
        if runtime.dimensions() != self.dimensions {
            return Err(EmbedError::invalid_config(format!(
                "model {} has {} dimensions, expected {}",
                self.config.model,
                runtime.dimensions(),
                self.dimensions
            )));
        }

        *self.runtime.write().unwrap_or_else(|e| e.into_inner()) = Some(runtime);
        self.progress("ready", 1.0, format!("{} ready", self.config.model));
        tracing::info!(embedder = %self.name, "Embedder ready");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.loaded().is_some()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::runtime("no embedding generated for text"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let runtime = self.runtime().await?;
        let cleaned: Vec<String> = texts.iter().map(|t| clean_text(t)).collect();
        let dimensions = self.dimensions;

        tracing::debug!(
            embedder = %self.name,
            count = cleaned.len(),
            batch_size = self.sizer.current(),
            "Embedding batch"
        );
        self.sizer
            .run(&self.name, &cleaned, &self.events, |batch| {
                Self::run_batch(Arc::clone(&runtime), batch, dimensions)
            })
            .await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&format!("{}{}", self.prefixes.query, text)).await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&format!("{}{}", self.prefixes.passage, text)).await
    }

    async fn embed_batch_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch(&Self::with_prefix(&self.prefixes.passage, texts))
            .await
    }

    fn current_batch_size(&self) -> usize {
        self.sizer.current()
    }

    fn reset_batch_size(&self) {
        self.sizer.reset();
    }

    fn subscribe(&self) -> broadcast::Receiver<EmbedderEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        self.runtime.write().unwrap_or_else(|e| e.into_inner()).take();
        tracing::debug!(embedder = %self.name, "Embedder disposed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedDevice;
    use crate::runtime::HashRuntime;

    /// Hash runtime that refuses batches at or above a size limit.
    struct LimitedFactory {
        limit: usize,
    }

    struct LimitedRuntime {
        inner: HashRuntime,
        limit: usize,
    }

    impl EmbeddingRuntime for LimitedRuntime {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.len() >= self.limit {
                return Err(EmbedError::runtime("allocation failed"));
            }
            self.inner.embed(texts)
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
    }

    impl RuntimeFactory for LimitedFactory {
        fn load(
            &self,
            config: &EmbedConfig,
            _device: ResolvedDevice,
        ) -> Result<Arc<dyn EmbeddingRuntime>> {
            Ok(Arc::new(LimitedRuntime {
                inner: HashRuntime::new(config.resolved_dimensions()?),
                limit: self.limit,
            }))
        }
    }

    fn hashed() -> ModelEmbedder {
        ModelEmbedder::new("hash", EmbedConfig::hashed(32)).unwrap()
    }

    #[tokio::test]
    async fn test_embed_is_deterministic() -> anyhow::Result<()> {
        let embedder = hashed();
        let a = embedder.embed("hello world").await?;
        let b = embedder.embed("hello world").await?;
        let c = embedder.embed("goodbye moon").await?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_and_document_prefixes() -> anyhow::Result<()> {
        let embedder = hashed();
        assert_eq!(
            embedder.embed_query("rust traits").await?,
            embedder.embed("query: rust traits").await?
        );
        assert_eq!(
            embedder.embed_document("rust traits").await?,
            embedder.embed("passage: rust traits").await?
        );
        let docs = embedder
            .embed_batch_documents(&["rust traits".to_string()])
            .await?;
        assert_eq!(docs[0], embedder.embed_document("rust traits").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_lazy_initialization_and_dispose() -> anyhow::Result<()> {
        let embedder = hashed();
        assert!(!embedder.is_ready());
        embedder.embed("x").await?;
        assert!(embedder.is_ready());
        embedder.dispose().await?;
        assert!(!embedder.is_ready());
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_emits_progress() -> anyhow::Result<()> {
        let embedder = hashed();
        let mut rx = embedder.subscribe();
        embedder.initialize().await?;
        let first = rx.recv().await?;
        assert!(matches!(first, EmbedderEvent::Progress { ref stage, .. } if stage == "loading"));
        let second = rx.recv().await?;
        assert!(matches!(second, EmbedderEvent::Progress { ref stage, .. } if stage == "ready"));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_fallback_through_embedder() -> anyhow::Result<()> {
        let embedder = ModelEmbedder::with_factory(
            "limited",
            EmbedConfig::hashed(16).with_batch_size(16),
            Arc::new(LimitedFactory { limit: 4 }),
        )?;
        embedder.initialize().await?;
        let mut rx = embedder.subscribe();

        let texts: Vec<String> = (0..12).map(|i| format!("document {i}")).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        assert_eq!(vectors.len(), 12);
        assert!(embedder.current_batch_size() <= 4);

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if event.is_warning() {
                warnings += 1;
            }
        }
        assert!(warnings >= 1);

        embedder.reset_batch_size();
        assert_eq!(embedder.current_batch_size(), 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_embed_with_details() -> anyhow::Result<()> {
        let embedder = hashed();
        let details = embedder.embed_with_details("twelve chars").await?;
        assert_eq!(details.model_id, "hash-e5");
        assert_eq!(details.dimensions, 32);
        assert_eq!(details.token_count, 3);
        Ok(())
    }
}
