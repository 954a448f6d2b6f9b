//! Background OCR job runner.
//!
//! Jobs live in the `ocr_jobs` table and move `pending -> processing ->
//! completed | failed`. A failed attempt is retried after `retry_delay` until
//! `max_retries` retries are used up; the job then stays `failed` for
//! inspection and nothing is thrown to the caller.
//!
//! The manager itself is `idle`, `running` or `paused`. While running, a
//! dispatcher task claims jobs as semaphore permits free up; pausing stops new
//! claims, and stopping waits for in-flight jobs before returning to idle.

use super::{OcrOutput, OcrProviderRegistry};
use crate::config::{OcrConfig, OcrMergeMode};
use crate::discovery::FileKind;
use crate::events::{EventBus, OcrEvent};
use crate::pipeline::ChunkBuilder;
use crate::storage::{
    ChunkPlacement, DocumentId, OcrJob, OcrJobStatus, OcrRegion, OcrStatus, SqliteStore,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrQueueState {
    Idle,
    Running,
    Paused,
}

impl fmt::Display for OcrQueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        })
    }
}

struct Worker {
    store: SqliteStore,
    providers: Arc<OcrProviderRegistry>,
    builder: ChunkBuilder,
    config: OcrConfig,
    events: EventBus,
    permits: Arc<Semaphore>,
}

pub struct OcrQueueManager {
    worker: Arc<Worker>,
    state: watch::Sender<OcrQueueState>,
    wakeup: Arc<Notify>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl OcrQueueManager {
    pub fn new(
        store: SqliteStore,
        providers: Arc<OcrProviderRegistry>,
        builder: ChunkBuilder,
        config: OcrConfig,
        events: EventBus,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            worker: Arc::new(Worker {
                store,
                providers,
                builder,
                config,
                events,
                permits,
            }),
            state: watch::Sender::new(OcrQueueState::Idle),
            wakeup: Arc::new(Notify::new()),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OcrQueueState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OcrQueueState> {
        self.state.subscribe()
    }

    fn transition(&self, from: &[OcrQueueState], to: OcrQueueState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        match previous {
            Some(from) => {
                tracing::debug!(%from, %to, "OCR queue state changed");
                self.worker.events.ocr(OcrEvent::StateChanged {
                    from: from.to_string(),
                    to: to.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Record a job for `document_id` and mark the document as awaiting OCR.
    pub async fn enqueue(
        &self,
        document_id: DocumentId,
        file_path: &str,
        regions: &[OcrRegion],
    ) -> Result<i64> {
        let store = &self.worker.store;
        let job_id = store.create_ocr_job(document_id, file_path, regions).await?;
        store.set_ocr_status(document_id, OcrStatus::Pending).await?;
        self.worker.events.ocr(OcrEvent::JobQueued {
            job_id,
            document_id,
        });
        self.wakeup.notify_one();
        Ok(job_id)
    }

    /// Start the background dispatcher. No-op unless idle.
    pub async fn start(&self) {
        if !self.transition(&[OcrQueueState::Idle], OcrQueueState::Running) {
            return;
        }
        let worker = Arc::clone(&self.worker);
        let state = self.state.subscribe();
        let wakeup = Arc::clone(&self.wakeup);
        let handle = tokio::spawn(dispatch(worker, state, wakeup));
        *self.dispatcher.lock().await = Some(handle);
    }

    pub fn pause(&self) -> bool {
        self.transition(&[OcrQueueState::Running], OcrQueueState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(&[OcrQueueState::Paused], OcrQueueState::Running)
    }

    /// Stop claiming jobs and wait for in-flight ones to finish.
    pub async fn stop(&self) {
        self.transition(
            &[OcrQueueState::Running, OcrQueueState::Paused],
            OcrQueueState::Idle,
        );
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "OCR dispatcher panicked");
            }
        }
    }

    /// Run every pending job now, bounded by the worker count, and return how
    /// many were processed. Works regardless of the manager state.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut running = JoinSet::new();
        let mut processed = 0;
        loop {
            let permit = Arc::clone(&self.worker.permits).acquire_owned().await?;
            let Some(job) = self.worker.store.claim_ocr_job().await? else {
                break;
            };
            let worker = Arc::clone(&self.worker);
            running.spawn(async move {
                worker.process(job).await;
                drop(permit);
            });
            processed += 1;
        }
        while running.join_next().await.is_some() {}
        Ok(processed)
    }
}

async fn dispatch(
    worker: Arc<Worker>,
    mut state: watch::Receiver<OcrQueueState>,
    wakeup: Arc<Notify>,
) {
    let mut running = JoinSet::new();
    loop {
        let current = *state.borrow_and_update();
        match current {
            OcrQueueState::Idle => break,
            OcrQueueState::Paused => {
                if state.changed().await.is_err() {
                    break;
                }
                continue;
            }
            OcrQueueState::Running => {}
        }
        while running.try_join_next().is_some() {}

        let permit = tokio::select! {
            permit = Arc::clone(&worker.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        match worker.store.claim_ocr_job().await {
            Ok(Some(job)) => {
                let worker = Arc::clone(&worker);
                running.spawn(async move {
                    worker.process(job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = wakeup.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(error = %e, "Failed to claim OCR job");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
    while running.join_next().await.is_some() {}
}

impl Worker {
    async fn process(&self, job: OcrJob) {
        let allowed = self.config.max_retries as i64 + 1;
        let mut attempt = job.attempts;
        loop {
            attempt += 1;
            self.events.ocr(OcrEvent::JobStarted {
                job_id: job.id,
                attempt: attempt as u32,
            });
            let outcome = self.recognize_and_store(&job).await;
            let settled = match outcome {
                Ok(chunks) => self.complete(&job, attempt, chunks).await,
                Err(e) => {
                    let message = format!("{e:#}");
                    let recorded =
                        self.store.record_ocr_attempt(job.id, attempt, Some(&message)).await;
                    if let Err(e) = recorded {
                        tracing::warn!(job_id = job.id, error = %e, "Failed to record OCR attempt");
                    }
                    if attempt < allowed {
                        tracing::debug!(job_id = job.id, attempt, error = %message, "Retrying OCR job");
                        self.events.ocr(OcrEvent::JobRetry {
                            job_id: job.id,
                            attempt: attempt as u32,
                            error: message,
                        });
                        tokio::time::sleep(self.config.retry_delay()).await;
                        continue;
                    }
                    self.fail(&job, &message).await
                }
            };
            if let Err(e) = settled {
                tracing::error!(job_id = job.id, error = %e, "Failed to settle OCR job");
            }
            return;
        }
    }

    async fn complete(&self, job: &OcrJob, attempt: i64, chunks: usize) -> Result<()> {
        self.store.record_ocr_attempt(job.id, attempt, None).await?;
        self.store.finish_ocr_job(job.id, OcrJobStatus::Completed, None).await?;
        self.store.set_ocr_status(job.document_id, OcrStatus::Completed).await?;
        tracing::info!(job_id = job.id, path = %job.file_path, chunks, "OCR job completed");
        self.events.ocr(OcrEvent::JobCompleted {
            job_id: job.id,
            document_id: job.document_id,
            chunks,
        });
        Ok(())
    }

    async fn fail(&self, job: &OcrJob, message: &str) -> Result<()> {
        self.store.finish_ocr_job(job.id, OcrJobStatus::Failed, Some(message)).await?;
        self.store.set_ocr_status(job.document_id, OcrStatus::Failed).await?;
        tracing::warn!(job_id = job.id, path = %job.file_path, error = %message, "OCR job failed");
        self.events.ocr(OcrEvent::JobFailed {
            job_id: job.id,
            document_id: job.document_id,
            error: message.to_string(),
        });
        Ok(())
    }

    async fn recognize_and_store(&self, job: &OcrJob) -> Result<usize> {
        let provider = self.providers.select(&self.config.languages).await?;
        let image = Path::new(&job.file_path);
        let mut outputs: Vec<OcrOutput> = Vec::with_capacity(job.regions.len());
        for region in &job.regions {
            outputs.push(provider.recognize(image, region, &self.config.languages).await?);
        }

        let min_confidence = self.config.merge.min_confidence;
        let mut chunks = Vec::new();
        for output in outputs {
            if output.confidence < min_confidence || output.text.trim().is_empty() {
                tracing::debug!(
                    job_id = job.id,
                    confidence = output.confidence,
                    "Dropping low-confidence OCR text"
                );
                continue;
            }
            let page = output.page.map(i64::from);
            chunks.extend(
                self.builder
                    .chunk(&output.text, FileKind::Text)?
                    .into_iter()
                    .map(|chunk| crate::storage::NewChunk { page, ..chunk }),
            );
        }
        if chunks.is_empty() {
            return Ok(0);
        }
        self.builder.embed(&mut chunks).await?;
        let placement = match self.config.merge.mode {
            OcrMergeMode::Append => ChunkPlacement::Append,
            OcrMergeMode::Prepend => ChunkPlacement::Prepend,
            OcrMergeMode::ByPage => ChunkPlacement::ByPage,
        };
        self.store
            .merge_chunks(job.document_id, &chunks, placement)
            .await?;
        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, OcrMergeOptions};
    use crate::ocr::testing::ScriptedProvider;
    use crate::storage::{NewChunk, NewDocument, VectorIndexConfig};
    use quarry_chunk::ChunkerRegistry;
    use quarry_embed::{EmbedConfig, Embedder, ModelEmbedder};
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: SqliteStore,
        manager: OcrQueueManager,
        provider: Arc<ScriptedProvider>,
        events: EventBus,
        document_id: DocumentId,
    }

    async fn fixture(provider: ScriptedProvider, config: OcrConfig) -> Result<Fixture> {
        let store = SqliteStore::open_memory(Some(16), VectorIndexConfig::default()).await?;
        let embedder: Arc<dyn Embedder> = Arc::new(ModelEmbedder::new("t", EmbedConfig::hashed(16))?);
        let builder = ChunkBuilder::new(
            Arc::new(ChunkerRegistry::with_defaults()),
            &ChunkingConfig::default(),
            Some(embedder),
        )?;
        let provider = Arc::new(provider);
        let providers = Arc::new(OcrProviderRegistry::new());
        providers.register(provider.clone());
        let events = EventBus::default();
        let document_id = store
            .upsert_document(&NewDocument {
                file_path: "/w/scan.png".into(),
                file_name: "scan.png".into(),
                file_hash: "h".into(),
                ..Default::default()
            })
            .await?;
        store
            .replace_chunks(
                document_id,
                &[NewChunk {
                    text: "caption".into(),
                    ..Default::default()
                }],
            )
            .await?;
        let manager =
            OcrQueueManager::new(store.clone(), providers, builder, config, events.clone());
        Ok(Fixture {
            store,
            manager,
            provider,
            events,
            document_id,
        })
    }

    fn fast_config(max_retries: u32) -> OcrConfig {
        OcrConfig {
            max_retries,
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_job_appends_chunks() -> Result<()> {
        let f = fixture(ScriptedProvider::new("scripted", "recognised words"), fast_config(0)).await?;
        let job_id = f
            .manager
            .enqueue(f.document_id, "/w/scan.png", &[OcrRegion::whole_image()])
            .await?;
        let doc = f.store.get_document(f.document_id).await?.unwrap();
        assert_eq!(doc.ocr_status, OcrStatus::Pending);

        assert_eq!(f.manager.run_pending().await?, 1);
        let job = f.store.get_ocr_job(job_id).await?.unwrap();
        assert_eq!(job.status, OcrJobStatus::Completed);
        assert_eq!(job.attempts, 1);
        let chunks = f.store.get_chunks(f.document_id).await?;
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["caption", "recognised words"]);
        assert!(chunks[1].embedding.is_some());
        let doc = f.store.get_document(f.document_id).await?.unwrap();
        assert_eq!(doc.ocr_status, OcrStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() -> Result<()> {
        let provider = ScriptedProvider::new("scripted", "text");
        provider.failures.store(2, Ordering::SeqCst);
        let f = fixture(provider, fast_config(3)).await?;
        let mut events = f.events.subscribe_ocr();
        let job_id = f
            .manager
            .enqueue(f.document_id, "/w/scan.png", &[OcrRegion::whole_image()])
            .await?;
        f.manager.run_pending().await?;

        let job = f.store.get_ocr_job(job_id).await?.unwrap();
        assert_eq!(job.status, OcrJobStatus::Completed);
        assert_eq!(job.attempts, 3);
        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OcrEvent::JobRetry { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_failed_job() -> Result<()> {
        let provider = ScriptedProvider::new("scripted", "text");
        provider.failures.store(100, Ordering::SeqCst);
        let f = fixture(provider, fast_config(1)).await?;
        let job_id = f
            .manager
            .enqueue(f.document_id, "/w/scan.png", &[OcrRegion::whole_image()])
            .await?;
        f.manager.run_pending().await?;

        let job = f.store.get_ocr_job(job_id).await?.unwrap();
        assert_eq!(job.status, OcrJobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.unwrap().contains("engine crashed"));
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 2);
        let doc = f.store.get_document(f.document_id).await?.unwrap();
        assert_eq!(doc.ocr_status, OcrStatus::Failed);
        assert_eq!(f.store.ocr_summary().await?.failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_low_confidence_text_dropped() -> Result<()> {
        let mut provider = ScriptedProvider::new("scripted", "blurry");
        provider.confidence = 30.0;
        let config = OcrConfig {
            merge: OcrMergeOptions {
                min_confidence: 50.0,
                ..Default::default()
            },
            ..fast_config(0)
        };
        let f = fixture(provider, config).await?;
        f.manager
            .enqueue(f.document_id, "/w/scan.png", &[OcrRegion::whole_image()])
            .await?;
        f.manager.run_pending().await?;
        assert_eq!(f.store.get_chunks(f.document_id).await?.len(), 1);
        assert_eq!(f.store.ocr_summary().await?.completed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_machine_and_dispatcher() -> Result<()> {
        let f = fixture(ScriptedProvider::new("scripted", "dispatched"), fast_config(0)).await?;
        let mut events = f.events.subscribe_ocr();
        assert_eq!(f.manager.state(), OcrQueueState::Idle);
        assert!(!f.manager.pause());

        f.manager.start().await;
        assert_eq!(f.manager.state(), OcrQueueState::Running);
        assert!(f.manager.pause());
        assert_eq!(f.manager.state(), OcrQueueState::Paused);
        assert!(f.manager.resume());

        f.manager
            .enqueue(f.document_id, "/w/scan.png", &[OcrRegion::whole_image()])
            .await?;
        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(OcrEvent::JobCompleted { chunks, .. }) = events.recv().await {
                    return chunks;
                }
            }
        })
        .await?;
        assert_eq!(completed, 1);

        f.manager.stop().await;
        assert_eq!(f.manager.state(), OcrQueueState::Idle);
        Ok(())
    }
}
