//! The indexing pipeline.
//!
//! One file goes through parse -> chunk -> embed -> store, with the document
//! status advanced at each step. Files that carry OCR regions are handed to
//! the OCR queue after their text is stored. [`IndexingPipeline::process_batch`]
//! is the unit of work the supervisor counts: it claims a batch from the
//! durable queue and settles every item before returning.

pub mod chunks;

pub use chunks::{ChunkBuilder, MARKDOWN_CHUNKER};

use crate::config::IndexingConfig;
use crate::discovery::{DiscoveredFile, FileDiscovery};
use crate::events::{EventBus, IndexingEvent};
use crate::ocr::OcrQueueManager;
use crate::parser::{self, ParsedDocument};
use crate::storage::{DocumentId, DocumentStatus, NewDocument, SqliteStore};
use crate::sync::forget_file;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Indexed {
        document_id: DocumentId,
        chunks: usize,
        ocr_job: Option<i64>,
    },
    /// The file is not indexable (filtered, oversized or binary).
    Skipped,
    /// The file no longer exists; its document was dropped.
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub indexed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed items put back for another attempt.
    pub retried: usize,
    /// Pending queue rows after the batch.
    pub remaining: i64,
    pub duration_ms: u64,
}

impl BatchReport {
    /// Queue items settled by this batch.
    pub fn processed(&self) -> usize {
        self.indexed + self.failed + self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.processed() == 0
    }
}

pub struct IndexingPipeline {
    store: SqliteStore,
    discovery: FileDiscovery,
    builder: ChunkBuilder,
    ocr: Option<Arc<OcrQueueManager>>,
    config: IndexingConfig,
    events: EventBus,
}

impl IndexingPipeline {
    pub fn new(
        store: SqliteStore,
        discovery: FileDiscovery,
        builder: ChunkBuilder,
        ocr: Option<Arc<OcrQueueManager>>,
        config: IndexingConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            discovery,
            builder,
            ocr,
            config,
            events,
        }
    }

    async fn set_status(&self, id: DocumentId, path: &str, status: DocumentStatus) -> Result<()> {
        self.store.set_document_status(id, status).await?;
        self.events.indexing(IndexingEvent::DocumentStatus {
            path: path.to_string(),
            status,
        });
        Ok(())
    }

    fn new_document(file: &DiscoveredFile, parsed: Option<&ParsedDocument>) -> NewDocument {
        NewDocument {
            file_path: file.path_str(),
            file_name: file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_extension: file.extension.clone(),
            file_size: file.size as i64,
            file_hash: file.hash.clone(),
            mime_type: parsed
                .and_then(|p| p.mime_type.clone())
                .or_else(|| parser::mime_type(&file.path)),
            title: parsed.and_then(|p| p.title.clone()),
            page_count: parsed.and_then(ParsedDocument::page_count),
            metadata: parsed
                .map(|p| p.metadata.clone())
                .unwrap_or(serde_json::Value::Null),
            ..Default::default()
        }
    }

    /// Index one file now, replacing whatever was stored for it.
    pub async fn index_file(&self, path: &Path) -> Result<FileOutcome> {
        if !tokio::fs::try_exists(path).await? {
            forget_file(&self.store, &path.to_string_lossy()).await?;
            return Ok(FileOutcome::Removed);
        }
        let Some(file) = self.discovery.inspect(path).await? else {
            return Ok(FileOutcome::Skipped);
        };
        let path_str = file.path_str();

        let document_id = self.store.upsert_document(&Self::new_document(&file, None)).await?;
        match self.index_document(document_id, &file).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let failed = self.set_status(document_id, &path_str, DocumentStatus::Failed);
                if let Err(status_err) = failed.await {
                    tracing::warn!(
                        path = %path_str,
                        error = %status_err,
                        "Failed to mark document failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn index_document(
        &self,
        document_id: DocumentId,
        file: &DiscoveredFile,
    ) -> Result<FileOutcome> {
        let path_str = file.path_str();
        self.set_status(document_id, &path_str, DocumentStatus::Parsing).await?;
        let parsed = parser::parse_file(&file.path, file.kind).await?;
        self.store
            .update_document_metadata(document_id, &Self::new_document(file, Some(&parsed)))
            .await?;

        self.set_status(document_id, &path_str, DocumentStatus::Chunking).await?;
        let mut chunks = self.builder.chunk(&parsed.text, file.kind)?;
        for chunk in &mut chunks {
            chunk.page = parsed.page_at(chunk.start_offset as usize);
        }

        self.set_status(document_id, &path_str, DocumentStatus::Embedding).await?;
        self.builder.embed(&mut chunks).await?;
        self.store.replace_chunks(document_id, &chunks).await?;
        self.set_status(document_id, &path_str, DocumentStatus::Indexed).await?;

        let ocr_job = match (&self.ocr, parsed.needs_ocr()) {
            (Some(ocr), true) => {
                Some(ocr.enqueue(document_id, &path_str, &parsed.ocr_regions).await?)
            }
            (None, true) => {
                tracing::debug!(path = %path_str, "OCR disabled; image indexed without text");
                None
            }
            _ => None,
        };
        Ok(FileOutcome::Indexed {
            document_id,
            chunks: chunks.len(),
            ocr_job,
        })
    }

    /// Claim up to `batch_size` queue rows and settle each one.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let started = Instant::now();
        let items = self.store.dequeue_batch(self.config.batch_size.max(1)).await?;
        let mut report = BatchReport::default();
        if items.is_empty() {
            return Ok(report);
        }
        self.events.indexing(IndexingEvent::BatchStarted { files: items.len() });

        for item in items {
            let file_started = Instant::now();
            match self.index_file(Path::new(&item.file_path)).await {
                Ok(outcome) => {
                    self.store.complete_queue_item(item.id).await?;
                    match outcome {
                        FileOutcome::Indexed { chunks, .. } => {
                            report.indexed += 1;
                            let duration_ms = file_started.elapsed().as_millis() as u64;
                            tracing::debug!(path = %item.file_path, chunks, duration_ms, "Indexed file");
                            self.events.indexing(IndexingEvent::FileIndexed {
                                path: item.file_path.clone(),
                                chunks,
                                duration_ms,
                            });
                        }
                        FileOutcome::Skipped | FileOutcome::Removed => report.skipped += 1,
                    }
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    let will_retry = self
                        .store
                        .fail_queue_item(item.id, &error, self.config.max_attempts)
                        .await?;
                    report.failed += 1;
                    if will_retry {
                        report.retried += 1;
                    }
                    tracing::warn!(path = %item.file_path, %error, will_retry, "Failed to index file");
                    self.events.indexing(IndexingEvent::FileFailed {
                        path: item.file_path.clone(),
                        error,
                        will_retry,
                    });
                }
            }
        }

        report.remaining = self.store.queue_summary().await?.pending;
        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            indexed = report.indexed,
            failed = report.failed,
            remaining = report.remaining,
            duration_ms = report.duration_ms,
            "Batch finished"
        );
        self.events.indexing(IndexingEvent::BatchCompleted {
            indexed: report.indexed,
            failed: report.failed,
            remaining: report.remaining,
            duration_ms: report.duration_ms,
        });
        Ok(report)
    }
}
