//! Live filesystem watching.
//!
//! notify events are debounced on notify's own thread and handed over as one
//! batch per debounce window through a channel. An async task consumes the
//! batches as a stream and turns each one into queue updates:
//!
//! - path gone: `unlink`, the document (or every document under a removed
//!   directory) is deleted
//! - path known to the store with a different hash: `change`
//! - indexable path not in the store: `add`
//!
//! Touches that leave the content hash unchanged are dropped.

use super::{forget_file, queue_file};
use crate::config::WatcherConfig;
use crate::discovery::FileDiscovery;
use crate::events::{EventBus, FileChangeKind, SyncEvent};
use crate::storage::SqliteStore;
use anyhow::{Context, Result};
use futures::StreamExt;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use std::collections::BTreeSet;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub struct FileWatcher {
    debouncer: Debouncer<notify::RecommendedWatcher>,
    listener: JoinHandle<()>,
    flushed: Arc<Notify>,
}

struct BatchHandler {
    store: SqliteStore,
    discovery: FileDiscovery,
    config: WatcherConfig,
    events: EventBus,
}

impl FileWatcher {
    /// Start watching `discovery.root()` recursively.
    pub fn start(
        store: SqliteStore,
        discovery: FileDiscovery,
        config: WatcherConfig,
        events: EventBus,
    ) -> Result<Self> {
        let root = discovery.root().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut debouncer = new_debouncer(
            Duration::from_millis(config.debounce_ms),
            move |res: DebounceEventResult| match res {
                Ok(events) => {
                    let paths = events.into_iter().map(|ev| ev.path).collect();
                    // The listener is gone only after stop().
                    let _ = tx.send(paths);
                }
                Err(e) => tracing::warn!(error = %e, "File watch error"),
            },
        )
        .context("Failed to create file watcher")?;
        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        let flushed = Arc::new(Notify::new());
        let handler = Arc::new(BatchHandler {
            store,
            discovery,
            config,
            events,
        });
        let notify = Arc::clone(&flushed);
        let listener = tokio::spawn(UnboundedReceiverStream::new(rx).for_each(move |paths| {
            let handler = Arc::clone(&handler);
            let notify = Arc::clone(&notify);
            async move {
                match handler.handle(paths).await {
                    Ok(0) => {}
                    Ok(_) => notify.notify_waiters(),
                    Err(e) => tracing::error!(error = %e, "Failed to apply file changes"),
                }
            }
        }));

        tracing::info!(root = %root.display(), "Watching for file changes");
        Ok(Self {
            debouncer,
            listener,
            flushed,
        })
    }

    /// Resolves after the next batch that changed the queue or the index.
    pub async fn changed(&self) {
        self.flushed.notified().await
    }

    pub fn flushed(&self) -> Arc<Notify> {
        Arc::clone(&self.flushed)
    }

    pub async fn stop(self) {
        let Self {
            debouncer,
            listener,
            ..
        } = self;
        // Dropping the debouncer drops the sender, which ends the listener.
        drop(debouncer);
        let _ = listener.await;
    }
}

impl BatchHandler {
    async fn handle(&self, paths: Vec<PathBuf>) -> Result<usize> {
        let unique: BTreeSet<PathBuf> = paths.into_iter().collect();
        let mut applied = 0;
        for path in unique {
            match self.apply(&path).await {
                Ok(Some(kind)) => {
                    applied += 1;
                    tracing::debug!(path = %path.display(), ?kind, "File changed");
                    self.events.sync(SyncEvent::FileChanged {
                        kind,
                        path: path.to_string_lossy().into_owned(),
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping change"),
            }
        }
        Ok(applied)
    }

    async fn apply(&self, path: &Path) -> Result<Option<FileChangeKind>> {
        if self.discovery.in_state_dir(path) {
            return Ok(None);
        }
        let path_str = path.to_string_lossy().into_owned();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut removed = forget_file(&self.store, &path_str).await?;
                if !removed {
                    let prefix = format!("{path_str}{MAIN_SEPARATOR}");
                    removed = self.store.delete_documents_under(&prefix).await? > 0;
                }
                return Ok(removed.then_some(FileChangeKind::Unlink));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        let Some(file) = self.discovery.inspect(path).await? else {
            return Ok(None);
        };
        let kind = match self.store.document_hash(&path_str).await? {
            Some(hash) if hash == file.hash => return Ok(None),
            Some(_) => FileChangeKind::Change,
            None => FileChangeKind::Add,
        };
        queue_file(
            &self.store,
            &file,
            self.config.priority,
            kind == FileChangeKind::Change,
        )
        .await?;
        Ok(Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::discovery::hash_bytes;
    use crate::storage::{NewDocument, QueuePriority, VectorIndexConfig};
    use tempfile::tempdir;

    async fn handler(root: &Path) -> Result<BatchHandler> {
        Ok(BatchHandler {
            store: SqliteStore::open_memory(None, VectorIndexConfig::default()).await?,
            discovery: FileDiscovery::new(root, DiscoveryConfig::default()),
            config: WatcherConfig::default(),
            events: EventBus::default(),
        })
    }

    #[tokio::test]
    async fn test_classifies_add_change_unlink() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let handler = handler(&root).await?;
        let mut events = handler.events.subscribe_sync();

        let added = root.join("new.md");
        tokio::fs::write(&added, "# New").await?;
        let changed = root.join("old.md");
        tokio::fs::write(&changed, "# Changed").await?;
        let removed = root.join("removed.md");
        for (path, content) in [(&changed, "# Old"), (&removed, "# Removed")] {
            handler
                .store
                .upsert_document(&NewDocument {
                    file_path: path.to_string_lossy().into_owned(),
                    file_name: "x".into(),
                    file_hash: hash_bytes(content.as_bytes()),
                    ..Default::default()
                })
                .await?;
        }

        let applied = handler
            .handle(vec![added.clone(), changed.clone(), removed.clone(), added.clone()])
            .await?;
        assert_eq!(applied, 3);

        let mut kinds = Vec::new();
        for _ in 0..3 {
            if let SyncEvent::FileChanged { kind, path } = events.recv().await? {
                kinds.push((kind, path));
            }
        }
        assert_eq!(kinds[0].0, FileChangeKind::Add);
        assert_eq!(kinds[1].0, FileChangeKind::Change);
        assert_eq!(kinds[2].0, FileChangeKind::Unlink);

        let queue = handler.store.queue_items(10).await?;
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|item| item.priority == QueuePriority::High));
        assert!(
            handler
                .store
                .get_document_by_path(&removed.to_string_lossy())
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_touch_and_state_dir_ignored() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let handler = handler(&root).await?;
        let path = root.join("same.txt");
        tokio::fs::write(&path, "same").await?;
        handler
            .store
            .upsert_document(&NewDocument {
                file_path: path.to_string_lossy().into_owned(),
                file_name: "same.txt".into(),
                file_hash: hash_bytes(b"same"),
                ..Default::default()
            })
            .await?;
        tokio::fs::create_dir_all(root.join(".quarry")).await?;
        tokio::fs::write(root.join(".quarry/index.db"), "db").await?;

        let applied = handler
            .handle(vec![path, root.join(".quarry/index.db")])
            .await?;
        assert_eq!(applied, 0);
        assert_eq!(handler.store.queue_summary().await?.total(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_watcher_queues_new_file() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let store = SqliteStore::open_memory(None, VectorIndexConfig::default()).await?;
        let watcher = FileWatcher::start(
            store.clone(),
            FileDiscovery::new(&root, DiscoveryConfig::default()),
            WatcherConfig {
                debounce_ms: 100,
                ..Default::default()
            },
            EventBus::default(),
        )?;
        let flushed = watcher.flushed();
        let changed = flushed.notified();
        tokio::pin!(changed);
        // Register interest before the write so the wakeup is not missed.
        changed.as_mut().enable();
        tokio::fs::write(root.join("watched.txt"), "hello").await?;
        tokio::time::timeout(Duration::from_secs(10), changed).await?;

        let items = store.queue_items(10).await?;
        assert_eq!(items.len(), 1);
        assert!(items[0].file_path.ends_with("watched.txt"));
        watcher.stop().await;
        Ok(())
    }
}
