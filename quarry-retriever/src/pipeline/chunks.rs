use crate::config::ChunkingConfig;
use crate::discovery::FileKind;
use crate::error::QuarryError;
use crate::storage::NewChunk;
use anyhow::Result;
use quarry_chunk::{ChunkOptions, ChunkerRegistry, MARKDOWN_DELIMITERS, RecursiveChunker};
use quarry_embed::Embedder;
use std::sync::Arc;

/// Registry name of the Markdown-aware recursive chunker.
pub const MARKDOWN_CHUNKER: &str = "markdown";

/// Chunks text with the configured chunker and embeds the result.
///
/// Shared by the indexing pipeline and the OCR queue so both write chunks the
/// same way.
#[derive(Clone)]
pub struct ChunkBuilder {
    chunkers: Arc<ChunkerRegistry>,
    chunker: String,
    options: ChunkOptions,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ChunkBuilder {
    pub fn new(
        chunkers: Arc<ChunkerRegistry>,
        config: &ChunkingConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let options = config.options();
        options.validate().map_err(QuarryError::from)?;
        chunkers.get(&config.chunker).map_err(QuarryError::from)?;
        if chunkers.get(MARKDOWN_CHUNKER).is_err() {
            let markdown = RecursiveChunker::with_delimiters(MARKDOWN_CHUNKER, MARKDOWN_DELIMITERS)
                .map_err(QuarryError::from)?;
            chunkers.register(Arc::new(markdown));
        }
        Ok(Self {
            chunkers,
            chunker: config.chunker.clone(),
            options,
            embedder,
        })
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    fn chunker_for(&self, kind: FileKind) -> &str {
        match kind {
            FileKind::Markdown if self.chunker == "recursive" => MARKDOWN_CHUNKER,
            _ => &self.chunker,
        }
    }

    /// Split `text` into unembedded chunks numbered from zero.
    pub fn chunk(&self, text: &str, kind: FileKind) -> Result<Vec<NewChunk>> {
        let chunks = self
            .chunkers
            .chunk_with(self.chunker_for(kind), text, &self.options)
            .map_err(QuarryError::from)?;
        Ok(chunks
            .into_iter()
            .map(|c| NewChunk {
                chunk_index: c.index as i64,
                text: c.text,
                embedding: None,
                start_offset: c.start_offset as i64,
                end_offset: c.end_offset as i64,
                page: None,
                section: c.section,
                token_count: c.token_count as i64,
            })
            .collect())
    }

    /// Fill in embeddings; a no-op when embeddings are disabled.
    pub async fn embed(&self, chunks: &mut [NewChunk]) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder
            .embed_batch_documents(&texts)
            .await
            .map_err(QuarryError::from)?;
        if vectors.len() != chunks.len() {
            return Err(QuarryError::RuntimeFailure(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            ))
            .into());
        }
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_embed::{EmbedConfig, ModelEmbedder};

    fn builder(embedder: Option<Arc<dyn Embedder>>) -> Result<ChunkBuilder> {
        let config = ChunkingConfig {
            max_chunk_size: 40,
            chunk_overlap: 0,
            ..Default::default()
        };
        ChunkBuilder::new(Arc::new(ChunkerRegistry::with_defaults()), &config, embedder)
    }

    #[test]
    fn test_markdown_uses_heading_aware_chunker() -> Result<()> {
        let builder = builder(None)?;
        let text = "# One\nshort intro line here\n# Two\nanother short line";
        let chunks = builder.chunk(text, FileKind::Markdown)?;
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 40));
        assert!(chunks.iter().any(|c| c.section.as_deref() == Some("Two")));
        assert!(builder.chunk("   ", FileKind::Text)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_embed_fills_vectors() -> Result<()> {
        let embedder: Arc<dyn Embedder> = Arc::new(ModelEmbedder::new("t", EmbedConfig::hashed(8))?);
        let builder = builder(Some(embedder))?;
        let mut chunks = builder.chunk("alpha beta", FileKind::Text)?;
        builder.embed(&mut chunks).await?;
        assert_eq!(chunks[0].embedding.as_ref().map(Vec::len), Some(8));
        Ok(())
    }

    #[test]
    fn test_unknown_chunker_is_not_found() {
        let config = ChunkingConfig {
            chunker: "nope".into(),
            ..Default::default()
        };
        let err = ChunkBuilder::new(Arc::new(ChunkerRegistry::with_defaults()), &config, None)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::NotFound(_))
        ));
    }
}
