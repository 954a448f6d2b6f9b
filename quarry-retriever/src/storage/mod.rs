//! Storage layer for the quarry indexing engine
//!
//! Everything the engine persists lives in one SQLite database: documents,
//! their chunks and embeddings, tags, the durable indexing queue, OCR jobs,
//! the FTS5 keyword index and the vector graph index. Keeping the vector
//! index inside the same file means a crash can never leave it out of step
//! with the chunks it points at.
//!
//! ## Key Components
//!
//! - **SqliteStore**: connection pool plus CRUD for every table
//! - **schema**: table, trigger and index definitions with schema versioning
//! - **vector_index**: graph-based approximate nearest neighbour search
//! - **SearchBackend**: the keyword / semantic / hybrid search primitives
//!
//! ## Architecture
//!
//! ```text
//! documents ─┬─ chunks ──┬── chunks_fts (triggers keep it in lockstep)
//!            │           └── vector_index (graph nodes, cascade on delete)
//!            ├─ document_tags ── tags
//!            └─ ocr_jobs
//! index_queue, search_config
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod schema;
pub mod search;
pub mod sqlite_store;
pub mod vector_index;

pub use sqlite_store::{ChunkPlacement, SqliteStore};
pub use vector_index::{DistanceMetric, NeighborCompression, VectorIndexConfig};

/// Database ID for a document.
pub type DocumentId = i64;

/// Database ID for a chunk.
pub type ChunkId = i64;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "invalid {}: '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

string_enum!(
    /// Where a document is in the indexing lifecycle.
    DocumentStatus {
        Pending => "pending",
        Parsing => "parsing",
        Chunking => "chunking",
        Embedding => "embedding",
        Indexed => "indexed",
        Failed => "failed",
    }
);

string_enum!(
    /// OCR state of a document.
    OcrStatus {
        NotNeeded => "not_needed",
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    /// Queue ordering class; lower rank is picked first.
    QueuePriority {
        High => "high",
        Normal => "normal",
        Low => "low",
        OcrDeferred => "ocr_deferred",
    }
);

string_enum!(
    /// State of a queue row.
    QueueStatus {
        Pending => "pending",
        Processing => "processing",
    }
);

string_enum!(
    /// State of an OCR job.
    OcrJobStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

impl QueuePriority {
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
            Self::OcrDeferred => 3,
        }
    }
}

/// One indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    pub file_extension: Option<String>,
    pub file_size: i64,
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<i64>,
    pub status: DocumentStatus,
    pub ocr_status: OcrStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Fields written when a document is first seen or re-parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_extension: Option<String>,
    pub file_size: i64,
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<i64>,
    pub metadata: serde_json::Value,
}

/// One stored text segment of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub start_offset: i64,
    pub end_offset: i64,
    pub page: Option<i64>,
    pub section: Option<String>,
    pub token_count: i64,
}

/// A chunk about to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub start_offset: i64,
    pub end_offset: i64,
    pub page: Option<i64>,
    pub section: Option<String>,
    pub token_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
}

/// A pending unit of indexing work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub file_path: String,
    pub file_size: i64,
    pub priority: QueuePriority,
    pub status: QueueStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sub-area of a document slated for OCR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrRegion {
    /// 1-based page number, when the document is paged.
    pub page: Option<u32>,
    /// `[x, y, width, height]` in pixels; `None` means the whole page/image.
    pub bbox: Option<[u32; 4]>,
    /// Image to recognise, when it is not the document file itself.
    pub image_path: Option<String>,
}

impl OcrRegion {
    pub fn whole_image() -> Self {
        Self {
            page: None,
            bbox: None,
            image_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrJob {
    pub id: i64,
    pub document_id: DocumentId,
    pub file_path: String,
    pub regions: Vec<OcrRegion>,
    pub status: OcrJobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Headline numbers for the collaborator surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: i64,
    pub indexed_documents: i64,
    pub total_chunks: i64,
    pub total_tags: i64,
    pub database_size: i64,
}

/// Counts of queue rows by state and priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub pending: i64,
    pub processing: i64,
    pub high: i64,
    pub normal: i64,
    pub low: i64,
    pub ocr_deferred: i64,
}

impl QueueSummary {
    pub fn total(&self) -> i64 {
        self.pending + self.processing
    }
}

/// Counts of OCR jobs by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrJobSummary {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Restricts which chunks a search may return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// File extensions without the dot, e.g. `["md", "rs"]`.
    pub file_types: Vec<String>,
    /// Only documents whose absolute path starts with this prefix.
    pub path_prefix: Option<String>,
    /// Only documents carrying every one of these tags.
    pub tags: Vec<String>,
    pub document_ids: Vec<DocumentId>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.file_types.is_empty()
            && self.path_prefix.is_none()
            && self.tags.is_empty()
            && self.document_ids.is_empty()
    }
}

/// Relative weight of keyword and vector scores in hybrid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub keyword: f32,
    pub semantic: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            semantic: 0.6,
        }
    }
}

/// How a hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Keyword,
    Semantic,
    Hybrid,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub section: Option<String>,
    pub page: Option<i64>,
    /// Final score in `[0, 1]` for keyword/hybrid, similarity for semantic.
    pub score: f32,
    pub keyword_score: Option<f32>,
    pub vector_score: Option<f32>,
    /// FTS snippet with `<mark>` highlighting, keyword matches only.
    pub snippet: Option<String>,
    pub match_type: MatchType,
    pub indexed_at: Option<DateTime<Utc>>,
}

/// The three search primitives the search service runs against.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Full-text search. `fts_query` must already be in FTS5 syntax.
    async fn search_keyword(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Nearest neighbours of `vector`.
    async fn search_semantic(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Weighted merge of keyword and vector results.
    async fn search_hybrid(
        &self,
        fts_query: &str,
        vector: &[f32],
        weights: HybridWeights,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|n| n.and_utc())
        })
        .unwrap_or_default()
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() -> Result<()> {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Parsing,
            DocumentStatus::Chunking,
            DocumentStatus::Embedding,
            DocumentStatus::Indexed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>()?, status);
        }
        assert_eq!("ocr_deferred".parse::<QueuePriority>()?, QueuePriority::OcrDeferred);
        assert!("bogus".parse::<OcrStatus>().is_err());
        Ok(())
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(QueuePriority::High.rank() < QueuePriority::Normal.rank());
        assert!(QueuePriority::Low.rank() < QueuePriority::OcrDeferred.rank());
    }

    #[test]
    fn test_timestamp_parsing() {
        let ts = parse_timestamp("2024-05-01T10:00:00.000000Z");
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        let ts = parse_timestamp("2024-05-01 10:00:00");
        assert_eq!(ts.timestamp(), 1714557600);
    }
}
