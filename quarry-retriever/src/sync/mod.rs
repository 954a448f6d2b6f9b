//! Disk-versus-index reconciliation.
//!
//! [`StartupSync`] compares one snapshot of discovered files against the
//! stored `path -> hash` pairs and queues the difference. [`FileWatcher`]
//! keeps the queue current afterwards from debounced filesystem events.

pub mod watcher;

pub use watcher::FileWatcher;

use crate::config::SyncConfig;
use crate::discovery::{DiscoveredFile, FileDiscovery, hash_file};
use crate::events::{EventBus, SyncEvent};
use crate::storage::{DocumentStatus, QueuePriority, SqliteStore};
use anyhow::Result;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Compute the report without touching the queue or the documents.
    pub dry_run: bool,
    /// Overrides the configured priority for queued files.
    pub priority: Option<QueuePriority>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }
}

/// Queue a new or changed file. A changed file loses its chunks and goes
/// back to `pending` until the pipeline picks it up again.
pub(crate) async fn queue_file(
    store: &SqliteStore,
    file: &DiscoveredFile,
    priority: QueuePriority,
    modified: bool,
) -> Result<()> {
    let path = file.path_str();
    if modified {
        if let Some(doc) = store.get_document_by_path(&path).await? {
            store.delete_chunks(doc.id).await?;
            store.set_document_status(doc.id, DocumentStatus::Pending).await?;
        }
    }
    store
        .enqueue(&path, file.size as i64, file.queue_priority(priority))
        .await
}

/// Forget a path that is gone from disk.
pub(crate) async fn forget_file(store: &SqliteStore, path: &str) -> Result<bool> {
    let removed = store.delete_document_by_path(path).await?;
    let dequeued = store.remove_from_queue(path).await?;
    Ok(removed || dequeued)
}

pub struct StartupSync {
    store: SqliteStore,
    discovery: FileDiscovery,
    config: SyncConfig,
    events: EventBus,
}

impl StartupSync {
    pub fn new(
        store: SqliteStore,
        discovery: FileDiscovery,
        config: SyncConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            discovery,
            config,
            events,
        }
    }

    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport> {
        let started = Instant::now();
        let files = self.discovery.discover().await?;
        let mut stored = self.store.stored_hashes().await?;
        let failed: HashSet<String> = self
            .store
            .paths_with_status(DocumentStatus::Failed)
            .await?
            .into_iter()
            .collect();
        let priority = options.priority.unwrap_or(self.config.priority);
        let interval = self.config.progress_interval.max(1);
        let total = files.len();

        let mut report = SyncReport::default();
        for (checked, file) in files.iter().enumerate() {
            let path = file.path_str();
            // Failed documents keep their hash; treat them as changed so
            // they are retried.
            match stored.remove(&path) {
                None => {
                    report.added.push(path);
                    if !options.dry_run {
                        queue_file(&self.store, file, priority, false).await?;
                    }
                }
                Some(hash) if hash != file.hash || failed.contains(&path) => {
                    report.modified.push(path);
                    if !options.dry_run {
                        queue_file(&self.store, file, priority, true).await?;
                    }
                }
                Some(_) => report.unchanged += 1,
            }
            if (checked + 1) % interval == 0 {
                self.events.sync(SyncEvent::Progress {
                    checked: checked + 1,
                    total,
                });
            }
        }

        let mut deleted: Vec<String> = stored.into_keys().collect();
        deleted.sort();
        if !options.dry_run {
            for path in &deleted {
                forget_file(&self.store, path).await?;
            }
        }
        report.deleted = deleted;
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            added = report.added.len(),
            modified = report.modified.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged,
            dry_run = options.dry_run,
            duration_ms = report.duration_ms,
            "Sync finished"
        );
        self.events.sync(SyncEvent::Completed {
            added: report.added.len(),
            modified: report.modified.len(),
            deleted: report.deleted.len(),
            unchanged: report.unchanged,
            duration_ms: report.duration_ms,
        });
        Ok(report)
    }

    /// Cheap check: file counts must match and a random sample of stored
    /// hashes must still match the files on disk. Any error counts as
    /// "needs sync".
    pub async fn needs_sync(&self) -> bool {
        match self.check_sample().await {
            Ok(check) => !check.in_sync,
            Err(e) => {
                tracing::debug!(error = %e, "needs_sync check failed; assuming sync is needed");
                true
            }
        }
    }

    /// Walks the tree without hashing, then hashes only the sampled paths.
    async fn check_sample(&self) -> Result<SampleCheck> {
        let paths: HashSet<String> = self
            .discovery
            .discover_paths()
            .await?
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let stored = self.store.stored_hashes().await?;
        let mut check = SampleCheck {
            in_sync: false,
            hashed: 0,
        };
        if paths.len() != stored.len() {
            return Ok(check);
        }
        let sample = stored
            .iter()
            .choose_multiple(&mut rand::rng(), self.config.needs_sync_sample);
        for (path, hash) in sample {
            if !paths.contains(path) {
                return Ok(check);
            }
            check.hashed += 1;
            if hash_file(Path::new(path)).await? != *hash {
                return Ok(check);
            }
        }
        check.in_sync = true;
        Ok(check)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SampleCheck {
    in_sync: bool,
    /// Files whose content was read.
    hashed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::discovery::hash_bytes;
    use crate::storage::{NewDocument, VectorIndexConfig};
    use tempfile::tempdir;

    async fn setup(root: &Path) -> Result<(SqliteStore, StartupSync, EventBus)> {
        let store = SqliteStore::open_memory(None, VectorIndexConfig::default()).await?;
        let events = EventBus::default();
        let sync = StartupSync::new(
            store.clone(),
            FileDiscovery::new(root, DiscoveryConfig::default()),
            SyncConfig {
                progress_interval: 1,
                ..Default::default()
            },
            events.clone(),
        );
        Ok((store, sync, events))
    }

    async fn record(store: &SqliteStore, path: &Path, content: &[u8]) -> Result<i64> {
        let id = store
            .upsert_document(&NewDocument {
                file_path: path.to_string_lossy().into_owned(),
                file_name: "x".to_string(),
                file_hash: hash_bytes(content),
                ..Default::default()
            })
            .await?;
        store.set_document_status(id, DocumentStatus::Indexed).await?;
        Ok(id)
    }

    #[tokio::test]
    async fn test_partition_and_apply() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let (store, sync, events) = setup(&root).await?;
        let mut progress = events.subscribe_sync();

        tokio::fs::write(root.join("same.txt"), "same").await?;
        tokio::fs::write(root.join("edited.txt"), "new content").await?;
        tokio::fs::write(root.join("fresh.txt"), "fresh").await?;
        record(&store, &root.join("same.txt"), b"same").await?;
        let edited = record(&store, &root.join("edited.txt"), b"old content").await?;
        record(&store, &root.join("gone.txt"), b"gone").await?;

        let preview = sync.sync(&SyncOptions { dry_run: true, ..Default::default() }).await?;
        assert_eq!(preview.added.len(), 1);
        assert_eq!(store.queue_summary().await?.total(), 0);
        assert_eq!(store.document_count().await?, 3);

        let report = sync.sync(&SyncOptions::default()).await?;
        assert!(report.added[0].ends_with("fresh.txt"));
        assert!(report.modified[0].ends_with("edited.txt"));
        assert!(report.deleted[0].ends_with("gone.txt"));
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.queue_summary().await?.pending, 2);
        assert_eq!(store.document_count().await?, 2);
        let doc = store.get_document(edited).await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);

        assert!(matches!(progress.recv().await?, SyncEvent::Progress { checked: 1, total: 3 }));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_documents_are_retried() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let (store, sync, _) = setup(&root).await?;
        tokio::fs::write(root.join("bad.txt"), "bad").await?;
        let id = record(&store, &root.join("bad.txt"), b"bad").await?;
        store.set_document_status(id, DocumentStatus::Failed).await?;

        let report = sync.sync(&SyncOptions::default()).await?;
        assert_eq!(report.modified.len(), 1);
        assert_eq!(report.unchanged, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_needs_sync() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let (store, sync, _) = setup(&root).await?;
        tokio::fs::write(root.join("a.txt"), "alpha").await?;
        assert!(sync.needs_sync().await);

        record(&store, &root.join("a.txt"), b"alpha").await?;
        assert!(!sync.needs_sync().await);

        tokio::fs::write(root.join("a.txt"), "changed").await?;
        assert!(sync.needs_sync().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_needs_sync_hashes_only_the_sample() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let store = SqliteStore::open_memory(None, VectorIndexConfig::default()).await?;
        let sync = StartupSync::new(
            store.clone(),
            FileDiscovery::new(&root, DiscoveryConfig::default()),
            SyncConfig {
                needs_sync_sample: 3,
                ..Default::default()
            },
            EventBus::default(),
        );
        for i in 0..20 {
            let path = root.join(format!("doc_{i}.txt"));
            let content = format!("document {i}");
            tokio::fs::write(&path, &content).await?;
            record(&store, &path, content.as_bytes()).await?;
        }

        let check = sync.check_sample().await?;
        assert!(check.in_sync);
        assert_eq!(check.hashed, 3);

        tokio::fs::write(root.join("extra.txt"), "extra").await?;
        let check = sync.check_sample().await?;
        assert!(!check.in_sync);
        assert_eq!(check.hashed, 0);
        Ok(())
    }
}
