//! SQLite implementation of the storage layer
//!
//! [`SqliteStore`] owns the connection pool and implements CRUD for documents,
//! chunks, tags, the indexing queue and OCR jobs. Every multi-row write runs in
//! a single transaction: replacing a document's chunks deletes the old rows,
//! inserts the new ones and links each embedded chunk into the vector graph
//! before committing, so a crash never leaves the keyword index, the vector
//! index and the chunk table disagreeing.
//!
//! ## SQLite Optimizations
//!
//! - **WAL mode**: readers (search) run while the indexer writes
//! - **Large page size** (64KB): suits embedding blobs
//! - **Auto-vacuum**: keeps the file from growing after deletes
//! - **Foreign keys**: cascades chunk, tag, OCR and vector rows with documents

use super::schema;
use super::vector_index::{VectorIndex, VectorIndexConfig};
use super::{
    ChunkId, Document, DocumentChunk, DocumentId, DocumentStatus, IndexStats, NewChunk,
    NewDocument, OcrJob, OcrJobStatus, OcrJobSummary, OcrRegion, OcrStatus, QueueItem,
    QueuePriority, QueueStatus, QueueSummary, Tag, now_rfc3339, parse_timestamp,
};
use anyhow::{Context, Result, bail};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where newly added chunks go relative to a document's existing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlacement {
    Append,
    Prepend,
    /// After the last existing chunk on the same or an earlier page.
    ByPage,
}

/// Orders queue rows: high, normal, low, then OCR-deferred.
const PRIORITY_ORDER: &str = "CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 WHEN 'low' THEN 2 ELSE 3 END";

/// SQLite-backed storage. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
    dimensions: Option<usize>,
    vectors: VectorIndex,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// `dimensions` is the embedding size, or `None` when embeddings are
    /// disabled. Queue rows and OCR jobs left in `processing` by a killed
    /// process are returned to `pending`.
    pub async fn open(
        path: &Path,
        dimensions: Option<usize>,
        vector_config: VectorIndexConfig,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::new_with_pool(pool, Some(path.to_path_buf()), dimensions, vector_config).await
    }

    /// In-memory database for tests.
    pub async fn open_memory(
        dimensions: Option<usize>,
        vector_config: VectorIndexConfig,
    ) -> Result<Self> {
        // One connection: every new in-memory connection is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool, None, dimensions, vector_config).await
    }

    async fn new_with_pool(
        pool: SqlitePool,
        path: Option<PathBuf>,
        dimensions: Option<usize>,
        vector_config: VectorIndexConfig,
    ) -> Result<Self> {
        vector_config.validate()?;
        schema::create_schema(&pool, dimensions).await?;
        let store = Self {
            pool,
            path,
            dimensions,
            vectors: VectorIndex::new(vector_config),
        };
        let (queue, ocr) = store.recover_interrupted().await?;
        if queue > 0 || ocr > 0 {
            tracing::info!(queue, ocr, "Recovered work interrupted by a previous run");
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn vector_index(&self) -> &VectorIndex {
        &self.vectors
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn recover_interrupted(&self) -> Result<(u64, u64)> {
        let now = now_rfc3339();
        let queue = sqlx::query(
            "UPDATE index_queue SET status = 'pending', updated_at = ? WHERE status = 'processing'",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        let ocr = sqlx::query(
            "UPDATE ocr_jobs SET status = 'pending', updated_at = ? WHERE status = 'processing'",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok((queue, ocr))
    }

    // ----- documents -------------------------------------------------------

    /// Insert or refresh a document by path. The status goes back to
    /// `pending`; the id of an existing row is kept.
    pub async fn upsert_document(&self, doc: &NewDocument) -> Result<DocumentId> {
        let now = now_rfc3339();
        let metadata = if doc.metadata.is_null() {
            "{}".to_string()
        } else {
            doc.metadata.to_string()
        };
        let id: DocumentId = sqlx::query_scalar(
            r#"
            INSERT INTO documents (
                file_path, file_name, file_extension, file_size, file_hash, mime_type,
                title, author, language, page_count, status, ocr_status,
                created_at, updated_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 'not_needed', ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                file_name = excluded.file_name,
                file_extension = excluded.file_extension,
                file_size = excluded.file_size,
                file_hash = excluded.file_hash,
                mime_type = excluded.mime_type,
                title = excluded.title,
                author = excluded.author,
                language = excluded.language,
                page_count = excluded.page_count,
                status = 'pending',
                updated_at = excluded.updated_at,
                metadata = excluded.metadata
            RETURNING id
            "#,
        )
        .bind(&doc.file_path)
        .bind(&doc.file_name)
        .bind(&doc.file_extension)
        .bind(doc.file_size)
        .bind(&doc.file_hash)
        .bind(&doc.mime_type)
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(&doc.language)
        .bind(doc.page_count)
        .bind(&now)
        .bind(&now)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Record what parsing learned about a document without touching its
    /// status or content hash.
    pub async fn update_document_metadata(&self, id: DocumentId, doc: &NewDocument) -> Result<()> {
        let metadata = if doc.metadata.is_null() {
            "{}".to_string()
        } else {
            doc.metadata.to_string()
        };
        sqlx::query(
            r#"
            UPDATE documents SET
                mime_type = ?, title = ?, author = ?, language = ?, page_count = ?,
                metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.mime_type)
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(&doc.language)
        .bind(doc.page_count)
        .bind(metadata)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_document_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE file_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY file_path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn set_document_status(&self, id: DocumentId, status: DocumentStatus) -> Result<()> {
        let now = now_rfc3339();
        let indexed_at = (status == DocumentStatus::Indexed).then(|| now.clone());
        sqlx::query(
            "UPDATE documents SET status = ?, updated_at = ?, indexed_at = COALESCE(?, indexed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(indexed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ocr_status(&self, id: DocumentId, status: OcrStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET ocr_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a document; chunks, tags, OCR jobs and vector nodes cascade.
    pub async fn delete_document(&self, id: DocumentId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        self.vectors.repair(&mut tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_document_by_path(&self, path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM documents WHERE file_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        self.vectors.repair(&mut tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every document whose path starts with `prefix`, along with
    /// their queue rows. Used when a whole directory disappears.
    pub async fn delete_documents_under(&self, prefix: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE substr(file_path, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM index_queue WHERE substr(file_path, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&mut *tx)
            .await?;
        self.vectors.repair(&mut tx).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Every stored `path -> content hash` pair.
    pub async fn stored_hashes(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT file_path, file_hash FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("file_path"), row.get("file_hash")))
            .collect())
    }

    pub async fn paths_with_status(&self, status: DocumentStatus) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT file_path FROM documents WHERE status = ? ORDER BY file_path")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    pub async fn document_hash(&self, path: &str) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT file_hash FROM documents WHERE file_path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash)
    }

    pub async fn document_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ----- chunks ----------------------------------------------------------

    fn check_embedding(&self, chunk: &NewChunk) -> Result<()> {
        if let (Some(embedding), Some(dims)) = (&chunk.embedding, self.dimensions) {
            if embedding.len() != dims {
                bail!(
                    "chunk {} has a {}-dimensional embedding, expected {}",
                    chunk.chunk_index,
                    embedding.len(),
                    dims
                );
            }
        }
        Ok(())
    }

    async fn insert_chunk(
        &self,
        conn: &mut SqliteConnection,
        document_id: DocumentId,
        chunk: &NewChunk,
    ) -> Result<ChunkId> {
        self.check_embedding(chunk)?;
        let embedding = chunk
            .embedding
            .as_ref()
            .map(|v| bytemuck::cast_slice::<f32, u8>(v).to_vec());
        let id: ChunkId = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (
                document_id, chunk_index, text, embedding, start_offset, end_offset,
                page, section, token_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(embedding)
        .bind(chunk.start_offset)
        .bind(chunk.end_offset)
        .bind(chunk.page)
        .bind(&chunk.section)
        .bind(chunk.token_count)
        .fetch_one(&mut *conn)
        .await?;
        if let Some(vector) = &chunk.embedding {
            self.vectors.insert(conn, id, vector).await?;
        }
        Ok(id)
    }

    /// Replace all chunks of a document in one transaction.
    pub async fn replace_chunks(
        &self,
        document_id: DocumentId,
        chunks: &[NewChunk],
    ) -> Result<Vec<ChunkId>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        self.vectors.repair(&mut tx).await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(self.insert_chunk(&mut tx, document_id, chunk).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Add chunks to a document that already has some, renumbering so that
    /// `chunk_index` stays dense and unique. `chunk_index` on the input is
    /// ignored.
    pub async fn merge_chunks(
        &self,
        document_id: DocumentId,
        chunks: &[NewChunk],
        placement: ChunkPlacement,
    ) -> Result<Vec<ChunkId>> {
        let mut tx = self.pool.begin().await?;
        let existing: Vec<(ChunkId, Option<i64>)> = sqlx::query(
            "SELECT id, page FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| (row.get("id"), row.get("page")))
        .collect();

        let order = merge_order(&existing, chunks, placement);

        // Move existing rows out of the way so renumbering cannot collide.
        sqlx::query("UPDATE chunks SET chunk_index = -chunk_index - 1 WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let mut ids = Vec::with_capacity(chunks.len());
        for (position, slot) in order.into_iter().enumerate() {
            match slot {
                Slot::Existing(id) => {
                    sqlx::query("UPDATE chunks SET chunk_index = ? WHERE id = ?")
                        .bind(position as i64)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                Slot::New(i) => {
                    let chunk = NewChunk {
                        chunk_index: position as i64,
                        ..chunks[i].clone()
                    };
                    ids.push(self.insert_chunk(&mut tx, document_id, &chunk).await?);
                }
            }
        }
        tx.commit().await?;
        Ok(ids)
    }

    pub async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        self.vectors.repair(&mut tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    pub async fn get_chunk(&self, id: ChunkId) -> Result<Option<DocumentChunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(chunk_from_row))
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ----- tags ------------------------------------------------------------

    /// Attach a tag, creating it on first use.
    pub async fn add_tag(&self, document_id: DocumentId, name: &str) -> Result<Tag> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO UPDATE SET name = excluded.name RETURNING id, name, color",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        let tag = Tag {
            id: row.get("id"),
            name: row.get("name"),
            color: row.get("color"),
        };
        sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag_id) VALUES (?, ?)")
            .bind(document_id)
            .bind(tag.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(tag)
    }

    pub async fn remove_tag(&self, document_id: DocumentId, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM document_tags WHERE document_id = ? AND tag_id IN (SELECT id FROM tags WHERE name = ?)",
        )
        .bind(document_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn tags_for_document(&self, document_id: DocumentId) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT t.id, t.name, t.color FROM tags t JOIN document_tags dt ON dt.tag_id = t.id WHERE dt.document_id = ? ORDER BY t.name",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Tag {
                id: row.get("id"),
                name: row.get("name"),
                color: row.get("color"),
            })
            .collect())
    }

    pub async fn documents_with_tag(&self, name: &str) -> Result<Vec<DocumentId>> {
        let ids: Vec<DocumentId> = sqlx::query_scalar(
            "SELECT dt.document_id FROM document_tags dt JOIN tags t ON t.id = dt.tag_id WHERE t.name = ? ORDER BY dt.document_id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // ----- indexing queue --------------------------------------------------

    /// Add a path to the queue. An existing row keeps its state and takes
    /// the more urgent of the two priorities. A row already claimed by a
    /// worker is flagged so it goes back to `pending` when that worker
    /// finishes instead of being removed.
    pub async fn enqueue(&self, path: &str, file_size: i64, priority: QueuePriority) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(&format!(
            r#"
            INSERT INTO index_queue (file_path, file_size, priority, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                file_size = excluded.file_size,
                priority = CASE WHEN ? < ({PRIORITY_ORDER}) THEN excluded.priority ELSE priority END,
                requeue = CASE WHEN status = 'processing' THEN 1 ELSE requeue END,
                updated_at = excluded.updated_at
            "#
        ))
        .bind(path)
        .bind(file_size)
        .bind(priority.as_str())
        .bind(&now)
        .bind(&now)
        .bind(priority.rank())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim up to `limit` pending rows in priority order, marking them
    /// `processing`.
    pub async fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT * FROM index_queue WHERE status = 'pending' ORDER BY {PRIORITY_ORDER}, created_at, id LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        let now = now_rfc3339();
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut item = queue_item_from_row(row)?;
            sqlx::query("UPDATE index_queue SET status = 'processing', requeue = 0, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
            item.status = QueueStatus::Processing;
            items.push(item);
        }
        tx.commit().await?;
        Ok(items)
    }

    /// Remove a finished row, or put it back as a fresh `pending` row when the
    /// path was re-queued while it was being processed.
    pub async fn complete_queue_item(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM index_queue WHERE id = ? AND requeue = 0")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            sqlx::query(
                "UPDATE index_queue SET status = 'pending', requeue = 0, attempts = 0, last_error = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(now_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed attempt. Returns `true` if the row was put back for
    /// another try, `false` if it was dropped after `max_attempts`.
    pub async fn fail_queue_item(&self, id: i64, error: &str, max_attempts: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT attempts, requeue FROM index_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((attempts, requeue)) = row else {
            return Ok(false);
        };
        // New content arrived mid-attempt: start its retries over.
        let attempts = if requeue != 0 { 0 } else { attempts + 1 };
        let retry = requeue != 0 || attempts < max_attempts;
        if retry {
            sqlx::query(
                "UPDATE index_queue SET status = 'pending', requeue = 0, attempts = ?, last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("DELETE FROM index_queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(retry)
    }

    pub async fn remove_from_queue(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM index_queue WHERE file_path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM index_queue ORDER BY {PRIORITY_ORDER}, created_at, id LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_item_from_row).collect()
    }

    pub async fn queue_summary(&self) -> Result<QueueSummary> {
        let rows = sqlx::query(
            "SELECT status, priority, COUNT(*) AS n FROM index_queue GROUP BY status, priority",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut summary = QueueSummary::default();
        for row in rows {
            let status: String = row.get("status");
            let priority: String = row.get("priority");
            let n: i64 = row.get("n");
            match QueueStatus::from_str(&status)? {
                QueueStatus::Pending => summary.pending += n,
                QueueStatus::Processing => summary.processing += n,
            }
            match QueuePriority::from_str(&priority)? {
                QueuePriority::High => summary.high += n,
                QueuePriority::Normal => summary.normal += n,
                QueuePriority::Low => summary.low += n,
                QueuePriority::OcrDeferred => summary.ocr_deferred += n,
            }
        }
        Ok(summary)
    }

    // ----- OCR jobs --------------------------------------------------------

    pub async fn create_ocr_job(
        &self,
        document_id: DocumentId,
        file_path: &str,
        regions: &[OcrRegion],
    ) -> Result<i64> {
        let now = now_rfc3339();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ocr_jobs (document_id, file_path, regions, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(document_id)
        .bind(file_path)
        .bind(serde_json::to_string(regions)?)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the oldest pending job, marking it `processing`.
    pub async fn claim_ocr_job(&self) -> Result<Option<OcrJob>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM ocr_jobs WHERE status = 'pending' ORDER BY id LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = ocr_job_from_row(&row)?;
        sqlx::query("UPDATE ocr_jobs SET status = 'processing', updated_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        job.status = OcrJobStatus::Processing;
        Ok(Some(job))
    }

    pub async fn record_ocr_attempt(
        &self,
        id: i64,
        attempts: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE ocr_jobs SET attempts = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(attempts)
            .bind(error)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a job to a terminal state.
    pub async fn finish_ocr_job(
        &self,
        id: i64,
        status: OcrJobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE ocr_jobs SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_ocr_job(&self, id: i64) -> Result<Option<OcrJob>> {
        let row = sqlx::query("SELECT * FROM ocr_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ocr_job_from_row).transpose()
    }

    pub async fn list_ocr_jobs(&self, status: Option<OcrJobStatus>) -> Result<Vec<OcrJob>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM ocr_jobs WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM ocr_jobs ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(ocr_job_from_row).collect()
    }

    pub async fn ocr_summary(&self) -> Result<OcrJobSummary> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM ocr_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut summary = OcrJobSummary::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match OcrJobStatus::from_str(&status)? {
                OcrJobStatus::Pending => summary.pending += n,
                OcrJobStatus::Processing => summary.processing += n,
                OcrJobStatus::Completed => summary.completed += n,
                OcrJobStatus::Failed => summary.failed += n,
            }
        }
        Ok(summary)
    }

    // ----- maintenance -----------------------------------------------------

    /// Rebuild the keyword index from the chunk table.
    pub async fn rebuild_fulltext(&self) -> Result<()> {
        sqlx::query("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')")
            .execute(&self.pool)
            .await?;
        tracing::info!("Rebuilt full-text index");
        Ok(())
    }

    /// Whether the keyword index agrees with the chunk table.
    pub async fn check_fulltext(&self) -> Result<bool> {
        let outcome = sqlx::query("INSERT INTO chunks_fts(chunks_fts, rank) VALUES ('integrity-check', 1)")
            .execute(&self.pool)
            .await;
        match outcome {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) => {
                tracing::warn!(error = %e, "Full-text index is out of sync with chunks");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rebuild_vector_index(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let count = self.vectors.rebuild(&mut tx).await?;
        tx.commit().await?;
        Ok(count)
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents) AS total_documents,
                (SELECT COUNT(*) FROM documents WHERE status = 'indexed') AS indexed_documents,
                (SELECT COUNT(*) FROM chunks) AS total_chunks,
                (SELECT COUNT(*) FROM tags) AS total_tags
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexStats {
            total_documents: row.get("total_documents"),
            indexed_documents: row.get("indexed_documents"),
            total_chunks: row.get("total_chunks"),
            total_tags: row.get("total_tags"),
            database_size: page_count * page_size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Existing(ChunkId),
    New(usize),
}

fn merge_order(
    existing: &[(ChunkId, Option<i64>)],
    new: &[NewChunk],
    placement: ChunkPlacement,
) -> Vec<Slot> {
    let old = existing.iter().map(|(id, _)| Slot::Existing(*id));
    let fresh = (0..new.len()).map(Slot::New);
    match placement {
        ChunkPlacement::Append => old.chain(fresh).collect(),
        ChunkPlacement::Prepend => fresh.chain(old).collect(),
        ChunkPlacement::ByPage => {
            // Insertion point per new chunk: after the last existing chunk whose
            // page is at or before the new chunk's page.
            let mut after: Vec<Vec<usize>> = vec![Vec::new(); existing.len() + 1];
            for (i, chunk) in new.iter().enumerate() {
                let slot = match chunk.page {
                    Some(page) => existing
                        .iter()
                        .rposition(|(_, p)| p.is_some_and(|p| p <= page))
                        .map(|pos| pos + 1)
                        .unwrap_or_else(|| {
                            if existing.iter().any(|(_, p)| p.is_some()) {
                                0
                            } else {
                                existing.len()
                            }
                        }),
                    None => existing.len(),
                };
                after[slot].push(i);
            }
            let mut order = Vec::with_capacity(existing.len() + new.len());
            for (pos, group) in after.into_iter().enumerate() {
                order.extend(group.into_iter().map(Slot::New));
                if let Some((id, _)) = existing.get(pos) {
                    order.push(Slot::Existing(*id));
                }
            }
            order
        }
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let ocr_status: String = row.get("ocr_status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let indexed_at: Option<String> = row.get("indexed_at");
    let metadata: String = row.get("metadata");
    Ok(Document {
        id: row.get("id"),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        file_extension: row.get("file_extension"),
        file_size: row.get("file_size"),
        file_hash: row.get("file_hash"),
        mime_type: row.get("mime_type"),
        title: row.get("title"),
        author: row.get("author"),
        language: row.get("language"),
        page_count: row.get("page_count"),
        status: status.parse()?,
        ocr_status: ocr_status.parse()?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        indexed_at: indexed_at.as_deref().map(parse_timestamp),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn chunk_from_row(row: &SqliteRow) -> DocumentChunk {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        embedding: embedding.map(|bytes| super::vector_index::decode_embedding(&bytes)),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        page: row.get("page"),
        section: row.get("section"),
        token_count: row.get("token_count"),
    }
}

fn queue_item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    let priority: String = row.get("priority");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(QueueItem {
        id: row.get("id"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        priority: priority.parse()?,
        status: status.parse()?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn ocr_job_from_row(row: &SqliteRow) -> Result<OcrJob> {
    let regions: String = row.get("regions");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let completed_at: Option<String> = row.get("completed_at");
    Ok(OcrJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        file_path: row.get("file_path"),
        regions: serde_json::from_str(&regions).context("Malformed OCR regions")?,
        status: status.parse()?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        completed_at: completed_at.as_deref().map(parse_timestamp),
    })
}
