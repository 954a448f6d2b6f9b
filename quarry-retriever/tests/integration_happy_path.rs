//! End-to-end scenarios for the indexing engine
//!
//! These tests drive the public engine API over a real workspace on disk:
//! - Indexing a mixed set of files and searching them with every strategy
//! - Sync round trips after no change, an edit and a deletion
//! - Web-search syntax reaching the keyword index
//! - Live watching feeding the queue

use anyhow::Result;
use quarry_retriever::config::{EngineConfig, SearchStrategy};
use quarry_retriever::engine::{Engine, IndexOptions};
use quarry_retriever::error::QuarryError;
use quarry_retriever::events::{IndexingEvent, SyncEvent};
use quarry_retriever::search::SearchOptions;
use quarry_retriever::storage::{DocumentStatus, SearchFilters};
use quarry_retriever::sync::SyncOptions;
use std::path::Path;
use tempfile::tempdir;
use tokio::time::{Duration, timeout};

async fn create_test_files(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root.join("docs")).await?;
    tokio::fs::write(
        root.join("docs/ownership.md"),
        "# Ownership\n\nEvery value has a single owner.\n\n## Borrowing\n\nReferences borrow without taking ownership.",
    )
    .await?;
    tokio::fs::write(
        root.join("docs/async.md"),
        "# Async\n\nFutures are polled by an executor such as tokio.",
    )
    .await?;
    tokio::fs::write(root.join("notes.txt"), "The fat rat sat on the cat mat.").await?;
    tokio::fs::write(root.join("recipe.txt"), "Slice tomatoes, add basil and olive oil.").await?;
    Ok(())
}

async fn engine(root: &Path) -> Result<Engine> {
    Engine::initialize(root, EngineConfig::for_testing().with_chunk_size(120, 20)).await
}

/// Index a workspace and query it with each strategy
#[tokio::test]
async fn test_index_and_search_every_strategy() -> Result<()> {
    let dir = tempdir()?;
    create_test_files(dir.path()).await?;
    let engine = engine(dir.path()).await?;
    let mut indexing = engine.events().subscribe_indexing();

    let summary = engine.index_all(&IndexOptions::default()).await?;
    assert_eq!(summary.indexed, 4);
    assert_eq!(summary.failed, 0);

    let mut indexed_events = 0;
    while let Ok(event) = indexing.try_recv() {
        if matches!(event, IndexingEvent::FileIndexed { .. }) {
            indexed_events += 1;
        }
    }
    assert_eq!(indexed_events, 4);

    let keyword = engine
        .search("tomatoes", &SearchOptions::default().with_strategy(SearchStrategy::Keyword))
        .await?;
    assert_eq!(keyword.strategy, SearchStrategy::Keyword);
    assert_eq!(keyword.results.len(), 1);
    assert!(keyword.results[0].file_path.ends_with("recipe.txt"));
    assert!(keyword.results[0].snippet.as_deref().unwrap_or("").contains("<mark>"));

    let semantic = engine
        .search(
            "Futures are polled by an executor",
            &SearchOptions::default().with_strategy(SearchStrategy::Semantic),
        )
        .await?;
    assert!(semantic.results[0].file_path.ends_with("async.md"));

    let hybrid = engine.search_default("borrow references").await?;
    assert_eq!(hybrid.strategy, SearchStrategy::Hybrid);
    let top = &hybrid.results[0];
    assert!(top.file_path.ends_with("ownership.md"));
    assert!(top.section.is_some());

    let filtered = engine
        .search(
            "owner OR tomatoes",
            &SearchOptions::default()
                .with_strategy(SearchStrategy::Keyword)
                .with_filters(SearchFilters {
                    file_types: vec!["md".into()],
                    ..Default::default()
                }),
        )
        .await?;
    assert!(!filtered.results.is_empty());
    assert!(filtered.results.iter().all(|hit| hit.file_path.ends_with(".md")));

    engine.close().await
}

/// Negation in web-search syntax excludes matching chunks
#[tokio::test]
async fn test_web_search_negation() -> Result<()> {
    let dir = tempdir()?;
    tokio::fs::write(dir.path().join("a.txt"), "the fat rat").await?;
    tokio::fs::write(dir.path().join("b.txt"), "the fat rat and the cat").await?;
    let engine = engine(dir.path()).await?;
    engine.index_all(&IndexOptions::default()).await?;

    let options = SearchOptions::default().with_strategy(SearchStrategy::Keyword);
    let response = engine.search("\"fat rat\" -cat", &options).await?;
    assert_eq!(response.fts_query, "\"fat rat\" NOT cat");
    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].file_path.ends_with("a.txt"));

    let err = engine.search("\"unbalanced", &options).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QuarryError>(),
        Some(QuarryError::InvalidOption(_))
    ));
    engine.close().await
}

/// Sync after indexing reports no changes, then picks up an edit and a deletion
#[tokio::test]
async fn test_sync_round_trip() -> Result<()> {
    let dir = tempdir()?;
    tokio::fs::write(dir.path().join("only.txt"), "original content").await?;
    let engine = engine(dir.path()).await?;
    engine.index_all(&IndexOptions::default()).await?;

    let report = engine.sync(&SyncOptions::default()).await?;
    assert!(!report.has_changes());
    assert_eq!(report.unchanged, 1);
    assert!(!engine.needs_sync().await);

    tokio::fs::write(dir.path().join("only.txt"), "rewritten content").await?;
    tokio::fs::write(dir.path().join("second.txt"), "another file").await?;
    assert!(engine.needs_sync().await);

    let mut sync_events = engine.events().subscribe_sync();
    let dry = engine.sync(&SyncOptions { dry_run: true, ..Default::default() }).await?;
    assert_eq!((dry.added.len(), dry.modified.len()), (1, 1));
    assert_eq!(engine.get_queue_status().await?.summary.pending, 0);

    let report = engine.sync(&SyncOptions::default()).await?;
    assert_eq!(report.added.len(), 1);
    assert!(report.modified[0].ends_with("only.txt"));
    assert!(report.deleted.is_empty());
    let only = engine
        .store()
        .get_document_by_path(&dir.path().canonicalize()?.join("only.txt").to_string_lossy())
        .await?
        .expect("document kept until re-indexed");
    assert_eq!(only.status, DocumentStatus::Pending);
    assert!(engine.store().get_chunks(only.id).await?.is_empty());

    let mut completed = false;
    while let Ok(event) = sync_events.try_recv() {
        completed |= matches!(event, SyncEvent::Completed { .. });
    }
    assert!(completed);

    engine.index_all(&IndexOptions { sync: false, ..Default::default() }).await?;
    let response = engine
        .search("rewritten", &SearchOptions::default().with_strategy(SearchStrategy::Keyword))
        .await?;
    assert_eq!(response.results.len(), 1);

    tokio::fs::remove_file(dir.path().join("second.txt")).await?;
    let report = engine.sync(&SyncOptions::default()).await?;
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(engine.get_stats().await?.total_documents, 1);
    engine.close().await
}

/// The watcher queues new files and the next batch indexes them
#[tokio::test]
async fn test_watch_queues_new_files() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine(dir.path()).await?;
    let watcher = engine.watch()?;
    let flushed = watcher.flushed();
    let notified = flushed.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    tokio::fs::write(dir.path().join("fresh.md"), "# Fresh\n\nWritten while watching.").await?;
    timeout(Duration::from_secs(10), notified).await?;

    let report = engine.process_batch().await?;
    assert_eq!(report.indexed, 1);
    watcher.stop().await;

    let response = engine
        .search("watching", &SearchOptions::default().with_strategy(SearchStrategy::Keyword))
        .await?;
    assert_eq!(response.results.len(), 1);
    engine.close().await
}
