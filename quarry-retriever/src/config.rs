//! Engine configuration.
//!
//! Loaded from `<root>/.quarry/config.toml` when it exists. Every section and
//! field has a default, so a partial file (or none at all) is valid.

use crate::error::QuarryError;
use crate::storage::{HybridWeights, QueuePriority, VectorIndexConfig};
use anyhow::{Context, Result};
use quarry_chunk::ChunkOptions;
use quarry_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hidden per-workspace directory holding the database and config.
pub const STATE_DIR: &str = ".quarry";
pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "index.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub discovery: DiscoveryConfig,
    pub chunking: ChunkingConfig,
    pub embeddings: EmbeddingsConfig,
    pub indexing: IndexingConfig,
    pub ocr: OcrConfig,
    pub search: SearchConfig,
    pub sync: SyncConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Overrides `<root>/.quarry/index.db`. Relative paths resolve against the root.
    pub path: Option<PathBuf>,
    pub vector_index: VectorIndexConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    pub include_hidden: bool,
    pub respect_gitignore: bool,
    /// Extensions to index, without the dot. Empty means every supported type.
    pub extensions: Vec<String>,
    /// Gitignore-style patterns to leave out.
    pub exclude: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            include_hidden: false,
            respect_gitignore: true,
            extensions: Vec::new(),
            exclude: vec!["node_modules/".to_string(), "target/".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Registry name of the chunker to use.
    pub chunker: String,
    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    pub track_sections: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let options = ChunkOptions::default();
        Self {
            chunker: "recursive".to_string(),
            max_chunk_size: options.max_chunk_size,
            chunk_overlap: options.chunk_overlap,
            track_sections: options.track_sections,
        }
    }
}

impl ChunkingConfig {
    pub fn options(&self) -> ChunkOptions {
        ChunkOptions::new(self.max_chunk_size, self.chunk_overlap)
            .with_track_sections(self.track_sections)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// When false, only keyword search is available.
    pub enabled: bool,
    /// Host the embedder on a dedicated worker thread.
    pub use_worker: bool,
    pub call_timeout_secs: u64,
    pub embedder: EmbedConfig,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_worker: true,
            call_timeout_secs: 300,
            embedder: EmbedConfig::default(),
        }
    }
}

impl EmbeddingsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Files claimed from the queue per batch.
    pub batch_size: usize,
    /// Attempts before a queue item is dropped.
    pub max_attempts: i64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
        }
    }
}

/// Where OCR text goes relative to the parsed text chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMergeMode {
    #[default]
    Append,
    Prepend,
    ByPage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrMergeOptions {
    pub mode: OcrMergeMode,
    /// Recognised text below this confidence (0-100) is discarded.
    pub min_confidence: f32,
}

impl Default for OcrMergeOptions {
    fn default() -> Self {
        Self {
            mode: OcrMergeMode::Append,
            min_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    /// Tesseract language codes, e.g. `eng`, `deu`.
    pub languages: Vec<String>,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Path or name of the tesseract executable.
    pub tesseract_command: String,
    pub merge: OcrMergeOptions,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: vec!["eng".to_string()],
            max_concurrent: 2,
            max_retries: 3,
            retry_delay_ms: 1000,
            tesseract_command: "tesseract".to_string(),
            merge: OcrMergeOptions::default(),
        }
    }
}

impl OcrConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Which search primitive a query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchStrategy {
    type Err = QuarryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyword" | "fts" => Ok(Self::Keyword),
            "semantic" | "vector" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(QuarryError::invalid_option(format!(
                "unknown search strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy: SearchStrategy,
    pub limit: usize,
    /// Interpret queries as Google-style web search syntax.
    pub web_search_syntax: bool,
    pub min_score: f32,
    pub weights: HybridWeights,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Hybrid,
            limit: 20,
            web_search_syntax: true,
            min_score: 0.0,
            weights: HybridWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Stored hashes compared by the quick needs-sync check.
    pub needs_sync_sample: usize,
    /// Files checked between progress events.
    pub progress_interval: usize,
    /// Queue priority for files found by sync.
    pub priority: QueuePriority,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            needs_sync_sample: 25,
            progress_interval: 100,
            priority: QueuePriority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    /// Queue priority for files changed while watching.
    pub priority: QueuePriority,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            priority: QueuePriority::High,
        }
    }
}

impl EngineConfig {
    pub fn state_dir(root: &Path) -> PathBuf {
        root.join(STATE_DIR)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::state_dir(root).join(CONFIG_FILE)
    }

    /// Load `<root>/.quarry/config.toml`, or defaults when it does not exist.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Self::load_from(&path).await
        } else {
            Ok(Self::default())
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// The database file for a workspace rooted at `root`.
    pub fn database_path(&self, root: &Path) -> PathBuf {
        match &self.database.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.join(path),
            None => Self::state_dir(root).join(DATABASE_FILE),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.options().validate().map_err(QuarryError::from)?;
        if self.embeddings.enabled {
            self.embeddings
                .embedder
                .validate()
                .map_err(QuarryError::from)?;
        }
        if self.indexing.batch_size == 0 {
            return Err(QuarryError::invalid_option("indexing.batch_size must be at least 1").into());
        }
        if self.ocr.max_concurrent == 0 {
            return Err(QuarryError::invalid_option("ocr.max_concurrent must be at least 1").into());
        }
        self.database.vector_index.validate()?;
        Ok(())
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = Some(path.into());
        self
    }

    pub fn with_embedder(mut self, embedder: EmbedConfig) -> Self {
        self.embeddings.embedder = embedder;
        self
    }

    pub fn with_embeddings_enabled(mut self, enabled: bool) -> Self {
        self.embeddings.enabled = enabled;
        self
    }

    pub fn with_worker(mut self, use_worker: bool) -> Self {
        self.embeddings.use_worker = use_worker;
        self
    }

    pub fn with_chunk_size(mut self, max_chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunking.max_chunk_size = max_chunk_size;
        self.chunking.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_ocr_enabled(mut self, enabled: bool) -> Self {
        self.ocr.enabled = enabled;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.indexing.batch_size = batch_size;
        self
    }

    /// Small, download-free settings for tests and demos.
    pub fn for_testing() -> Self {
        Self::default()
            .with_embedder(EmbedConfig::hashed(64))
            .with_worker(false)
            .with_ocr_enabled(false)
            .with_chunk_size(400, 50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_toml_uses_defaults() -> Result<()> {
        let config: EngineConfig = toml::from_str(
            r#"
            [chunking]
            max_chunk_size = 500

            [search]
            strategy = "keyword"
            "#,
        )?;
        assert_eq!(config.chunking.max_chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.search.strategy, SearchStrategy::Keyword);
        assert_eq!(config.sync.needs_sync_sample, 25);
        assert_eq!(config.watcher.priority, QueuePriority::High);
        Ok(())
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let config = EngineConfig::default().with_chunk_size(100, 100);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_database_path_resolution() {
        let root = Path::new("/work");
        assert_eq!(
            EngineConfig::default().database_path(root),
            PathBuf::from("/work/.quarry/index.db")
        );
        assert_eq!(
            EngineConfig::default()
                .with_database_path("data/idx.db")
                .database_path(root),
            PathBuf::from("/work/data/idx.db")
        );
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(EngineConfig::load(dir.path()).await?, EngineConfig::default());

        let config = EngineConfig::for_testing();
        config.save(&EngineConfig::config_path(dir.path())).await?;
        let loaded = EngineConfig::load(dir.path()).await?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("HYBRID".parse::<SearchStrategy>().unwrap(), SearchStrategy::Hybrid);
        assert!("fuzzy".parse::<SearchStrategy>().is_err());
    }
}
