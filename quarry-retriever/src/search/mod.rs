//! Query execution on top of a [`SearchBackend`].
//!
//! [`SearchService`] turns a user query into FTS5 syntax, embeds it when a
//! semantic strategy is requested, runs the matching backend primitive and
//! applies paging and the score floor. Without an embedder, semantic and
//! hybrid requests fall back to keyword search.

pub mod query;

pub use query::{convert_to_query, plain_query, validate_query};

use crate::config::{SearchConfig, SearchStrategy};
use crate::error::QuarryError;
use crate::storage::{HybridWeights, SearchBackend, SearchFilters, SearchHit};
use anyhow::Result;
use quarry_embed::Embedder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub strategy: SearchStrategy,
    pub limit: usize,
    pub offset: usize,
    pub weights: HybridWeights,
    pub filters: SearchFilters,
    /// Parse Google-style syntax; otherwise AND the raw terms.
    pub web_search_syntax: bool,
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            strategy: config.strategy,
            limit: config.limit,
            offset: 0,
            weights: config.weights,
            filters: SearchFilters::default(),
            web_search_syntax: config.web_search_syntax,
            min_score: config.min_score,
        }
    }

    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub took_ms: u64,
    /// Strategy actually used, after any fallback.
    pub strategy: SearchStrategy,
    /// The FTS5 expression the query was translated to.
    pub fts_query: String,
}

pub struct SearchService {
    backend: Arc<dyn SearchBackend>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SearchService {
    pub fn new(backend: Arc<dyn SearchBackend>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { backend, embedder }
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let started = Instant::now();
        let fts_query = if options.web_search_syntax {
            let converted = convert_to_query(query)?;
            if !converted.is_empty() {
                validate_query(&converted)?;
            }
            converted
        } else {
            plain_query(query)
        };

        let strategy = match (options.strategy, &self.embedder) {
            (SearchStrategy::Keyword, _) => SearchStrategy::Keyword,
            (requested, None) => {
                tracing::warn!(?requested, "Embeddings are disabled; using keyword search");
                SearchStrategy::Keyword
            }
            (requested, Some(_)) => requested,
        };

        let fetch = options.limit.saturating_add(options.offset);
        let filters = &options.filters;
        let hits = match (strategy, &self.embedder) {
            (SearchStrategy::Semantic, Some(embedder)) => {
                let vector = embedder.embed_query(query).await.map_err(QuarryError::from)?;
                self.backend.search_semantic(&vector, filters, fetch).await?
            }
            (SearchStrategy::Hybrid, Some(embedder)) => {
                let vector = embedder.embed_query(query).await.map_err(QuarryError::from)?;
                self.backend
                    .search_hybrid(&fts_query, &vector, options.weights, filters, fetch)
                    .await
                    .map_err(keyword_error)?
            }
            _ => self
                .backend
                .search_keyword(&fts_query, filters, fetch)
                .await
                .map_err(keyword_error)?,
        };

        let results = hits
            .into_iter()
            .skip(options.offset)
            .filter(|hit| hit.score >= options.min_score)
            .take(options.limit)
            .collect::<Vec<_>>();
        let took_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            query,
            fts_query = %fts_query,
            ?strategy,
            results = results.len(),
            took_ms,
            "Search finished"
        );
        Ok(SearchResponse {
            results,
            took_ms,
            strategy,
            fts_query,
        })
    }
}

/// FTS5 reports query syntax problems as database errors.
fn keyword_error(err: anyhow::Error) -> anyhow::Error {
    let message = err.to_string();
    if message.contains("fts5") || message.contains("syntax error") {
        QuarryError::invalid_option(format!("keyword query rejected: {message}")).into()
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentStatus, NewChunk, NewDocument, SqliteStore, VectorIndexConfig};
    use quarry_embed::{EmbedConfig, ModelEmbedder};

    async fn service(with_embedder: bool) -> Result<SearchService> {
        let embedder: Arc<dyn Embedder> =
            Arc::new(ModelEmbedder::new("test", EmbedConfig::hashed(32))?);
        let store = SqliteStore::open_memory(Some(32), VectorIndexConfig::default()).await?;
        let texts = [
            ("/w/a.md", "the quick brown fox jumps"),
            ("/w/b.md", "lazy dogs sleep all day"),
            ("/w/c.md", "a quick nap for the dog"),
        ];
        for (path, text) in texts {
            let id = store
                .upsert_document(&NewDocument {
                    file_path: path.to_string(),
                    file_name: path.to_string(),
                    file_extension: Some("md".to_string()),
                    file_hash: "h".to_string(),
                    ..Default::default()
                })
                .await?;
            let embedding = embedder.embed_document(text).await?;
            store
                .replace_chunks(
                    id,
                    &[NewChunk {
                        text: text.to_string(),
                        embedding: Some(embedding),
                        end_offset: text.len() as i64,
                        ..Default::default()
                    }],
                )
                .await?;
            store.set_document_status(id, DocumentStatus::Indexed).await?;
        }
        Ok(SearchService::new(
            Arc::new(store),
            with_embedder.then_some(embedder),
        ))
    }

    #[tokio::test]
    async fn test_keyword_with_web_syntax() -> Result<()> {
        let service = service(true).await?;
        let options = SearchOptions::default().with_strategy(SearchStrategy::Keyword);
        let response = service.search("quick -fox", &options).await?;
        assert_eq!(response.fts_query, "quick NOT fox");
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].file_path, "/w/c.md");
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_returns_ranked_hits() -> Result<()> {
        let service = service(true).await?;
        let response = service
            .search("quick fox", &SearchOptions::default().with_limit(2))
            .await?;
        assert_eq!(response.strategy, SearchStrategy::Hybrid);
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].file_path, "/w/a.md");
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_semantic_degrades_without_embedder() -> Result<()> {
        let service = service(false).await?;
        let options = SearchOptions::default().with_strategy(SearchStrategy::Semantic);
        let response = service.search("dogs", &options).await?;
        assert_eq!(response.strategy, SearchStrategy::Keyword);
        assert_eq!(response.results.len(), 1);
        assert!(logs_contain("Embeddings are disabled"));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_query_is_invalid_option() -> Result<()> {
        let service = service(true).await?;
        let err = service
            .search("\"unterminated", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::InvalidOption(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_offset_and_min_score() -> Result<()> {
        let service = service(true).await?;
        let mut options = SearchOptions::default()
            .with_strategy(SearchStrategy::Keyword)
            .with_limit(10);
        let all = service.search("quick", &options).await?;
        assert_eq!(all.results.len(), 2);
        options.offset = 1;
        let paged = service.search("quick", &options).await?;
        assert_eq!(paged.results.len(), 1);
        assert_eq!(paged.results[0].chunk_id, all.results[1].chunk_id);
        options.offset = 0;
        options.min_score = 2.0;
        assert!(service.search("quick", &options).await?.results.is_empty());
        Ok(())
    }
}
