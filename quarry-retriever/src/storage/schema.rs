//! Table, trigger and index definitions.
//!
//! ```sql
//! documents      -- one row per file, unique absolute path
//! chunks         -- UNIQUE(document_id, chunk_index), cascade with documents
//! chunks_fts     -- FTS5 external-content table over chunks.text
//! vector_index   -- ANN graph nodes, cascade with chunks
//! vector_index_tombstones -- neighbour lists of removed nodes, until repaired
//! tags, document_tags
//! index_queue    -- durable indexing queue, unique path
//! ocr_jobs
//! search_config  -- key/value: schema_version, embedding_dimensions
//! ```
//!
//! The FTS table is maintained only by the triggers below, never written
//! directly by application code.

use anyhow::{Result, bail};
use sqlx::SqlitePool;

pub const SCHEMA_VERSION: i64 = 1;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        file_name TEXT NOT NULL,
        file_extension TEXT,
        file_size INTEGER NOT NULL DEFAULT 0,
        file_hash TEXT NOT NULL,
        mime_type TEXT,
        title TEXT,
        author TEXT,
        language TEXT,
        page_count INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        ocr_status TEXT NOT NULL DEFAULT 'not_needed',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        indexed_at TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    "CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(file_hash)",
    // chunks is created separately: its CHECK depends on the dimensions.
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
        text,
        content='chunks',
        content_rowid='id',
        tokenize='unicode61 remove_diacritics 2'
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks BEGIN
        INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_update AFTER UPDATE OF text ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
        INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vector_index (
        chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
        vector BLOB NOT NULL,
        neighbors BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vector_index_tombstones (
        chunk_id INTEGER PRIMARY KEY,
        neighbors BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS vector_index_tombstone AFTER DELETE ON vector_index BEGIN
        INSERT OR REPLACE INTO vector_index_tombstones(chunk_id, neighbors)
        VALUES (old.chunk_id, old.neighbors);
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        color TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_tags (
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (document_id, tag_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_document_tags_tag ON document_tags(tag_id)",
    r#"
    CREATE TABLE IF NOT EXISTS index_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        file_size INTEGER NOT NULL DEFAULT 0,
        priority TEXT NOT NULL DEFAULT 'normal',
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        -- set when the path is re-queued while a worker holds it
        requeue INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_index_queue_status ON index_queue(status, priority)",
    r#"
    CREATE TABLE IF NOT EXISTS ocr_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        regions TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ocr_jobs_status ON ocr_jobs(status)",
    r#"
    CREATE TABLE IF NOT EXISTS search_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

fn chunks_table(dimensions: Option<usize>) -> String {
    let check = match dimensions {
        Some(dims) => format!(" CHECK (embedding IS NULL OR length(embedding) = {})", dims * 4),
        None => String::new(),
    };
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB{check},
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            page INTEGER,
            section TEXT,
            token_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (document_id, chunk_index)
        )
        "#
    )
}

/// Create every table, trigger and index that does not exist yet, then
/// record or verify the schema version and embedding dimensions.
pub async fn create_schema(pool: &SqlitePool, dimensions: Option<usize>) -> Result<()> {
    // documents must exist before chunks references it.
    sqlx::query(STATEMENTS[0]).execute(pool).await?;
    sqlx::query(&chunks_table(dimensions)).execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;
    for statement in &STATEMENTS[1..] {
        sqlx::query(statement).execute(pool).await?;
    }

    match get_config_value(pool, "schema_version").await? {
        None => set_config_value(pool, "schema_version", &SCHEMA_VERSION.to_string()).await?,
        Some(version) if version.parse::<i64>().ok() == Some(SCHEMA_VERSION) => {}
        Some(version) => bail!(
            "database schema version {version} is not supported (expected {SCHEMA_VERSION})"
        ),
    }
    check_dimensions(pool, dimensions).await
}

/// Record the embedding size on first use and refuse a different one later.
async fn check_dimensions(pool: &SqlitePool, dimensions: Option<usize>) -> Result<()> {
    let Some(dims) = dimensions else {
        return Ok(());
    };
    match get_config_value(pool, "embedding_dimensions").await? {
        None => set_config_value(pool, "embedding_dimensions", &dims.to_string()).await,
        Some(stored) if stored.parse::<usize>().ok() == Some(dims) => Ok(()),
        Some(stored) => bail!(
            "database was built with {stored}-dimensional embeddings but the embedder produces {dims}; \
             delete the index or switch back to the original model"
        ),
    }
}

pub async fn get_config_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM search_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_config_value(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO search_config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> Result<SqlitePool> {
        Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?)
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() -> Result<()> {
        let pool = memory_pool().await?;
        create_schema(&pool, Some(4)).await?;
        create_schema(&pool, Some(4)).await?;
        assert_eq!(
            get_config_value(&pool, "schema_version").await?.as_deref(),
            Some("1")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() -> Result<()> {
        let pool = memory_pool().await?;
        create_schema(&pool, Some(4)).await?;
        assert!(create_schema(&pool, Some(8)).await.is_err());
        // Opening without an embedder is always allowed.
        create_schema(&pool, None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_length_checked() -> Result<()> {
        let pool = memory_pool().await?;
        create_schema(&pool, Some(2)).await?;
        sqlx::query(
            "INSERT INTO documents (file_path, file_name, file_hash, created_at, updated_at) VALUES ('/a', 'a', 'h', '', '')",
        )
        .execute(&pool)
        .await?;
        let bad = sqlx::query(
            "INSERT INTO chunks (document_id, chunk_index, text, embedding, start_offset, end_offset) VALUES (1, 0, 'x', ?, 0, 1)",
        )
        .bind(vec![0u8; 4])
        .execute(&pool)
        .await;
        assert!(bad.is_err());
        sqlx::query(
            "INSERT INTO chunks (document_id, chunk_index, text, embedding, start_offset, end_offset) VALUES (1, 0, 'x', ?, 0, 1)",
        )
        .bind(vec![0u8; 8])
        .execute(&pool)
        .await?;
        Ok(())
    }
}
