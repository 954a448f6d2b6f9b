//! The engine handle: everything needed to index and search one workspace.
//!
//! [`Engine::initialize`] builds the registries, the store and the services
//! explicitly and owns them; nothing is global, so two engines (or a test and
//! the engine under test) never share state. The methods here are the call
//! surface used by the CLI, the supervisor's in-process backend and the IPC
//! child.
//!
//! ## Lifecycle
//!
//! ```text
//! initialize ──► sync ──► process_batch* ──► run_ocr ──► close
//!                  ▲            │
//!                  └── watch ◄──┘
//! ```

use crate::config::EngineConfig;
use crate::discovery::FileDiscovery;
use crate::error::QuarryError;
use crate::events::EventBus;
use crate::ocr::{OcrProviderRegistry, OcrQueueManager, OcrQueueState, TesseractProvider};
use crate::pipeline::{BatchReport, ChunkBuilder, FileOutcome, IndexingPipeline};
use crate::search::{SearchOptions, SearchResponse, SearchService};
use crate::storage::{
    IndexStats, OcrJob, OcrJobStatus, OcrJobSummary, QueueItem, QueueSummary, SqliteStore,
};
use crate::sync::{FileWatcher, StartupSync, SyncOptions, SyncReport};
use anyhow::{Context, Result};
use quarry_chunk::ChunkerRegistry;
use quarry_embed::{Embedder, EmbedderEvent, EmbedderRegistry, EmbedderWorker, ModelEmbedder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Registry name of the embedder built from the configuration.
pub const DEFAULT_EMBEDDER: &str = "default";

/// Queue rows listed by [`Engine::get_queue_status`].
const QUEUE_LISTING: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Reconcile disk and database before draining the queue.
    pub sync: bool,
    /// Stop after this many batches; `None` drains the queue.
    pub max_batches: Option<usize>,
    /// Run pending OCR jobs after the queue is drained.
    pub run_ocr: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            sync: true,
            max_batches: None,
            run_ocr: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub indexed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl IndexSummary {
    pub fn add(&mut self, batch: &BatchReport) {
        self.indexed += batch.indexed;
        self.failed += batch.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueReport {
    pub summary: QueueSummary,
    /// Head of the queue in pick-up order.
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReport {
    pub enabled: bool,
    pub state: OcrQueueState,
    pub summary: OcrJobSummary,
    /// Jobs that used up their retries.
    pub failed_jobs: Vec<OcrJob>,
}

pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    store: SqliteStore,
    discovery: FileDiscovery,
    embedders: EmbedderRegistry,
    embedder: Option<Arc<dyn Embedder>>,
    search: SearchService,
    pipeline: IndexingPipeline,
    ocr: Option<Arc<OcrQueueManager>>,
    events: EventBus,
}

impl Engine {
    /// Open the workspace at `root` and get every component ready.
    ///
    /// # Arguments
    /// * `root` - Workspace directory; it must exist and is canonicalized
    /// * `config` - Engine settings, usually from [`EngineConfig::load`]
    ///
    /// # Errors
    /// Fails when the root is missing, the configuration is inconsistent, the
    /// embedding model cannot be loaded or the database cannot be opened.
    pub async fn initialize(root: &Path, config: EngineConfig) -> Result<Self> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(QuarryError::from)
            .with_context(|| format!("Workspace root {} is not accessible", root.display()))?;
        config.validate()?;
        let started = Instant::now();

        let embedders = EmbedderRegistry::new();
        let embedder = if config.embeddings.enabled {
            let model: Arc<dyn Embedder> = Arc::new(
                ModelEmbedder::new(DEFAULT_EMBEDDER, config.embeddings.embedder.clone())
                    .map_err(QuarryError::from)?,
            );
            let hosted: Arc<dyn Embedder> = if config.embeddings.use_worker {
                Arc::new(
                    EmbedderWorker::spawn(model, config.embeddings.call_timeout())
                        .map_err(QuarryError::from)?,
                )
            } else {
                model
            };
            embedders.register(hosted);
            Some(
                embedders
                    .initialize_default()
                    .await
                    .map_err(QuarryError::from)
                    .context("Failed to initialize the embedding model")?,
            )
        } else {
            None
        };
        let dimensions = embedder.as_ref().map(|e| e.dimensions());

        let database = config.database_path(&root);
        let store =
            SqliteStore::open(&database, dimensions, config.database.vector_index.clone()).await?;
        let events = EventBus::default();
        let discovery = FileDiscovery::new(&root, config.discovery.clone());
        let chunkers = Arc::new(ChunkerRegistry::with_defaults());
        let builder = ChunkBuilder::new(chunkers, &config.chunking, embedder.clone())?;

        let ocr = config.ocr.enabled.then(|| {
            let providers = Arc::new(OcrProviderRegistry::new());
            providers.register(Arc::new(TesseractProvider::new(
                config.ocr.tesseract_command.clone(),
                config.ocr.languages.clone(),
            )));
            Arc::new(OcrQueueManager::new(
                store.clone(),
                providers,
                builder.clone(),
                config.ocr.clone(),
                events.clone(),
            ))
        });

        let search = SearchService::new(Arc::new(store.clone()), embedder.clone());
        let pipeline = IndexingPipeline::new(
            store.clone(),
            discovery.clone(),
            builder,
            ocr.clone(),
            config.indexing.clone(),
            events.clone(),
        );

        tracing::info!(
            root = %root.display(),
            database = %database.display(),
            dimensions = ?dimensions,
            ocr = config.ocr.enabled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Engine initialized"
        );
        Ok(Self {
            root,
            config,
            store,
            discovery,
            embedders,
            embedder,
            search,
            pipeline,
            ocr,
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Embedder notifications, when embeddings are enabled.
    pub fn subscribe_embedder(&self) -> Option<broadcast::Receiver<EmbedderEvent>> {
        self.embedder.as_ref().map(|e| e.subscribe())
    }

    fn startup_sync(&self) -> StartupSync {
        StartupSync::new(
            self.store.clone(),
            self.discovery.clone(),
            self.config.sync.clone(),
            self.events.clone(),
        )
    }

    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport> {
        self.startup_sync().sync(options).await
    }

    /// Cheap check for drift between disk and database.
    pub async fn needs_sync(&self) -> bool {
        self.startup_sync().needs_sync().await
    }

    /// Index one batch from the queue.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        self.pipeline.process_batch().await
    }

    /// Sync, drain the queue and run OCR.
    pub async fn index_all(&self, options: &IndexOptions) -> Result<IndexSummary> {
        let started = Instant::now();
        if options.sync {
            self.sync(&SyncOptions::default()).await?;
        }
        let mut summary = IndexSummary::default();
        let mut batches = 0;
        while options.max_batches.is_none_or(|max| batches < max) {
            let report = self.process_batch().await?;
            if report.is_empty() {
                break;
            }
            summary.add(&report);
            batches += 1;
        }
        if options.run_ocr {
            self.run_ocr().await?;
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            indexed = summary.indexed,
            failed = summary.failed,
            batches,
            duration_ms = summary.duration_ms,
            "Indexing finished"
        );
        Ok(summary)
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        self.search.search(query, options).await
    }

    /// Search with the configured defaults.
    pub async fn search_default(&self, query: &str) -> Result<SearchResponse> {
        self.search(query, &SearchOptions::from_config(&self.config.search)).await
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        self.store.get_stats().await
    }

    pub async fn get_queue_status(&self) -> Result<QueueReport> {
        Ok(QueueReport {
            summary: self.store.queue_summary().await?,
            items: self.store.queue_items(QUEUE_LISTING).await?,
        })
    }

    /// Re-index `path` now, bypassing the queue. Returns whether the file was
    /// indexed; removed or non-indexable files return `false`.
    pub async fn reindex_file(&self, path: &Path) -> Result<bool> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let outcome = self.pipeline.index_file(&path).await?;
        Ok(matches!(outcome, FileOutcome::Indexed { .. }))
    }

    /// Run every pending OCR job; 0 when OCR is disabled.
    pub async fn run_ocr(&self) -> Result<usize> {
        match &self.ocr {
            Some(ocr) => ocr.run_pending().await,
            None => Ok(0),
        }
    }

    /// The OCR manager, for starting the background dispatcher.
    pub fn ocr(&self) -> Option<&Arc<OcrQueueManager>> {
        self.ocr.as_ref()
    }

    pub async fn ocr_status(&self) -> Result<OcrReport> {
        Ok(OcrReport {
            enabled: self.ocr.is_some(),
            state: self
                .ocr
                .as_ref()
                .map_or(OcrQueueState::Idle, |ocr| ocr.state()),
            summary: self.store.ocr_summary().await?,
            failed_jobs: self.store.list_ocr_jobs(Some(OcrJobStatus::Failed)).await?,
        })
    }

    /// Start watching the workspace; changes land in the queue.
    pub fn watch(&self) -> Result<FileWatcher> {
        FileWatcher::start(
            self.store.clone(),
            self.discovery.clone(),
            self.config.watcher.clone(),
            self.events.clone(),
        )
    }

    /// Stop background work, release the model and close the database.
    pub async fn close(self) -> Result<()> {
        if let Some(ocr) = &self.ocr {
            ocr.stop().await;
        }
        self.embedders.reset().await.map_err(QuarryError::from)?;
        self.store.close().await;
        tracing::debug!(root = %self.root.display(), "Engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchStrategy;
    use tempfile::tempdir;

    async fn engine(root: &Path) -> Result<Engine> {
        Engine::initialize(root, EngineConfig::for_testing()).await
    }

    #[tokio::test]
    async fn test_index_all_then_search() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("rust.md"), "# Ownership\n\nBorrowing rules keep memory safe.").await?;
        tokio::fs::write(dir.path().join("garden.txt"), "Tomatoes need sun and water.").await?;
        let engine = engine(dir.path()).await?;

        let summary = engine.index_all(&IndexOptions::default()).await?;
        assert_eq!(summary.indexed, 2);
        assert_eq!(summary.failed, 0);

        let stats = engine.get_stats().await?;
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.indexed_documents, 2);
        assert!(stats.total_chunks >= 2);

        let options = SearchOptions::default().with_strategy(SearchStrategy::Keyword);
        let response = engine.search("tomatoes", &options).await?;
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].file_path.ends_with("garden.txt"));

        let hybrid = engine.search_default("borrowing memory").await?;
        assert!(hybrid.results[0].file_path.ends_with("rust.md"));
        engine.close().await
    }

    #[tokio::test]
    async fn test_reindex_file_and_queue_status() -> Result<()> {
        let dir = tempdir()?;
        let engine = engine(dir.path()).await?;
        tokio::fs::write(dir.path().join("a.txt"), "first version").await?;

        assert!(engine.reindex_file(Path::new("a.txt")).await?);
        assert!(!engine.reindex_file(Path::new("missing.txt")).await?);

        tokio::fs::write(dir.path().join("b.txt"), "queued").await?;
        engine.sync(&SyncOptions::default()).await?;
        let queue = engine.get_queue_status().await?;
        assert_eq!(queue.summary.pending, 1);
        assert!(queue.items[0].file_path.ends_with("b.txt"));

        let ocr = engine.ocr_status().await?;
        assert!(!ocr.enabled);
        assert_eq!(ocr.state, OcrQueueState::Idle);
        assert_eq!(engine.run_ocr().await?, 0);
        engine.close().await
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let err = Engine::initialize(Path::new("/definitely/not/here"), EngineConfig::for_testing())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::NotFound(_))
        ));
    }
}
