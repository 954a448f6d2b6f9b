//! Typed event channels.
//!
//! Each category has its own `tokio::sync::broadcast` channel on the
//! [`EventBus`]. Subscribers get a receiver and unsubscribe by dropping it, so
//! nothing outlives a supervisor restart. [`EngineEvent`] wraps every category
//! for forwarding over IPC.

use crate::storage::DocumentStatus;
use quarry_embed::EmbedderEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Pipeline lifecycle and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexingEvent {
    BatchStarted { files: usize },
    DocumentStatus { path: String, status: DocumentStatus },
    FileIndexed { path: String, chunks: usize, duration_ms: u64 },
    FileFailed { path: String, error: String, will_retry: bool },
    BatchCompleted { indexed: usize, failed: usize, remaining: i64, duration_ms: u64 },
}

/// What the watcher saw happen to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

/// Startup sync and watcher notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Progress { checked: usize, total: usize },
    Completed { added: usize, modified: usize, deleted: usize, unchanged: usize, duration_ms: u64 },
    FileChanged { kind: FileChangeKind, path: String },
}

/// OCR queue notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OcrEvent {
    StateChanged { from: String, to: String },
    JobQueued { job_id: i64, document_id: i64 },
    JobStarted { job_id: i64, attempt: u32 },
    JobRetry { job_id: i64, attempt: u32, error: String },
    JobCompleted { job_id: i64, document_id: i64, chunks: usize },
    JobFailed { job_id: i64, document_id: i64, error: String },
}

/// Any engine event, as forwarded from a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Indexing(IndexingEvent),
    Sync(SyncEvent),
    Ocr(OcrEvent),
    Embedder(EmbedderEvent),
}

/// One broadcast channel per event category.
#[derive(Debug, Clone)]
pub struct EventBus {
    indexing: broadcast::Sender<IndexingEvent>,
    sync: broadcast::Sender<SyncEvent>,
    ocr: broadcast::Sender<OcrEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            indexing: broadcast::channel(capacity).0,
            sync: broadcast::channel(capacity).0,
            ocr: broadcast::channel(capacity).0,
        }
    }

    // Sends ignore the no-subscriber error.
    pub fn indexing(&self, event: IndexingEvent) {
        let _ = self.indexing.send(event);
    }

    pub fn sync(&self, event: SyncEvent) {
        let _ = self.sync.send(event);
    }

    pub fn ocr(&self, event: OcrEvent) {
        let _ = self.ocr.send(event);
    }

    pub fn subscribe_indexing(&self) -> broadcast::Receiver<IndexingEvent> {
        self.indexing.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub fn subscribe_ocr(&self) -> broadcast::Receiver<OcrEvent> {
        self.ocr.subscribe()
    }

    /// Forward every category (plus embedder notifications, when given) to
    /// `sink` as [`EngineEvent`]s until the handles are aborted or the bus is
    /// dropped.
    pub fn forward<F>(
        &self,
        embedder: Option<broadcast::Receiver<EmbedderEvent>>,
        sink: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(EngineEvent) + Clone + Send + Sync + 'static,
    {
        let mut handles = vec![
            spawn_forwarder(self.subscribe_indexing(), EngineEvent::Indexing, sink.clone()),
            spawn_forwarder(self.subscribe_sync(), EngineEvent::Sync, sink.clone()),
            spawn_forwarder(self.subscribe_ocr(), EngineEvent::Ocr, sink.clone()),
        ];
        if let Some(rx) = embedder {
            handles.push(spawn_forwarder(rx, EngineEvent::Embedder, sink));
        }
        handles
    }
}

fn spawn_forwarder<T, F>(
    mut rx: broadcast::Receiver<T>,
    wrap: fn(T) -> EngineEvent,
    sink: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(EngineEvent) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => sink(wrap(event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event forwarder lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
