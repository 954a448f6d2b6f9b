//! Hosting an embedder on a dedicated thread.
//!
//! [`EmbedderWorker::spawn`] moves an embedder onto its own OS thread with a
//! private current-thread tokio runtime, so model loading and inference never
//! run on the orchestrating runtime's threads. The host talks to it with
//! tagged [`WorkerRequest`] messages over a flume channel; each request carries
//! a correlation id, and replies plus asynchronous notifications come back on
//! a second channel. The returned [`EmbedderWorker`] implements [`Embedder`]
//! itself, so it can be registered like any other embedder.

use crate::error::{EmbedError, Result};
use crate::events::EmbedderEvent;
use crate::provider::Embedder;
use crate::rpc::{CallError, PendingCalls};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Requests the host can send to the worker thread.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    Initialize,
    Embed { text: String },
    EmbedBatch { texts: Vec<String> },
    EmbedQuery { text: String },
    EmbedDocument { text: String },
    EmbedBatchDocuments { texts: Vec<String> },
    IsReady,
    ResetBatchSize,
    Dispose,
}

impl WorkerRequest {
    fn operation(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Embed { .. } => "embed",
            Self::EmbedBatch { .. } => "embed_batch",
            Self::EmbedQuery { .. } => "embed_query",
            Self::EmbedDocument { .. } => "embed_document",
            Self::EmbedBatchDocuments { .. } => "embed_batch_documents",
            Self::IsReady => "is_ready",
            Self::ResetBatchSize => "reset_batch_size",
            Self::Dispose => "dispose",
        }
    }
}

/// Successful reply payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Done,
    Ready(bool),
    Vector(Vec<f32>),
    Vectors(Vec<Vec<f32>>),
}

/// Messages from the worker thread to the host.
#[derive(Debug)]
pub enum WorkerMessage {
    Response {
        id: String,
        result: Result<WorkerReply>,
    },
    Notification(EmbedderEvent),
}

struct Envelope {
    id: String,
    request: WorkerRequest,
}

/// Host-side handle to an embedder running on its own thread.
pub struct EmbedderWorker {
    name: String,
    model_id: String,
    dimensions: usize,
    max_tokens: usize,
    multilingual: bool,
    priority: i32,
    configured_batch_size: usize,
    batch_size: Arc<AtomicUsize>,
    ready: Arc<AtomicBool>,
    requests: flume::Sender<Envelope>,
    pending: Arc<PendingCalls<Result<WorkerReply>>>,
    events: broadcast::Sender<EmbedderEvent>,
    call_timeout: Duration,
}

impl EmbedderWorker {
    /// Start a worker thread hosting `embedder`.
    ///
    /// Must be called from within a tokio runtime: the reply dispatcher runs
    /// as a task on the caller's runtime.
    ///
    /// # Arguments
    /// * `embedder` - The embedder to host; it is only touched from the worker thread
    /// * `call_timeout` - Upper bound for every request, including model loading
    pub fn spawn(embedder: Arc<dyn Embedder>, call_timeout: Duration) -> Result<Self> {
        let (request_tx, request_rx) = flume::unbounded::<Envelope>();
        let (message_tx, message_rx) = flume::unbounded::<WorkerMessage>();
        let (events, _) = broadcast::channel(64);

        let worker = Self {
            name: embedder.name().to_string(),
            model_id: embedder.model_id().to_string(),
            dimensions: embedder.dimensions(),
            max_tokens: embedder.max_tokens(),
            multilingual: embedder.is_multilingual(),
            priority: embedder.priority(),
            configured_batch_size: embedder.current_batch_size(),
            batch_size: Arc::new(AtomicUsize::new(embedder.current_batch_size())),
            ready: Arc::new(AtomicBool::new(embedder.is_ready())),
            requests: request_tx,
            pending: Arc::new(PendingCalls::new()),
            events,
            call_timeout,
        };

        let thread_name = format!("embed-worker-{}", worker.name);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_worker_thread(embedder, request_rx, message_tx))?;

        tokio::spawn(dispatch_messages(
            message_rx,
            Arc::clone(&worker.pending),
            worker.events.clone(),
            Arc::clone(&worker.batch_size),
        ));

        Ok(worker)
    }

    async fn call(&self, request: WorkerRequest) -> Result<WorkerReply> {
        let operation = request.operation();
        let (id, rx) = self.pending.register();
        self.requests
            .send_async(Envelope {
                id: id.clone(),
                request,
            })
            .await
            .map_err(|_| {
                self.pending.cancel(&id);
                EmbedError::WorkerClosed
            })?;

        match self.pending.wait(&id, rx, self.call_timeout).await {
            Ok(result) => result,
            Err(CallError::TimedOut(after)) => Err(EmbedError::Timeout {
                operation: operation.to_string(),
                after,
            }),
            Err(CallError::Closed) => Err(EmbedError::WorkerClosed),
        }
    }

    async fn call_vector(&self, request: WorkerRequest) -> Result<Vec<f32>> {
        match self.call(request).await? {
            WorkerReply::Vector(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    async fn call_vectors(&self, request: WorkerRequest) -> Result<Vec<Vec<f32>>> {
        match self.call(request).await? {
            WorkerReply::Vectors(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the worker thread directly whether its embedder is ready.
    pub async fn query_ready(&self) -> Result<bool> {
        match self.call(WorkerRequest::IsReady).await? {
            WorkerReply::Ready(ready) => {
                self.ready.store(ready, Ordering::SeqCst);
                Ok(ready)
            }
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: WorkerReply) -> EmbedError {
    EmbedError::runtime(format!("unexpected worker reply: {reply:?}"))
}

/// Routes worker messages to pending calls and subscribers.
async fn dispatch_messages(
    messages: flume::Receiver<WorkerMessage>,
    pending: Arc<PendingCalls<Result<WorkerReply>>>,
    events: broadcast::Sender<EmbedderEvent>,
    batch_size: Arc<AtomicUsize>,
) {
    while let Ok(message) = messages.recv_async().await {
        match message {
            WorkerMessage::Response { id, result } => {
                if !pending.complete(&id, result) {
                    tracing::debug!(%id, "Dropping reply for abandoned embedding call");
                }
            }
            WorkerMessage::Notification(event) => {
                if let EmbedderEvent::BatchSizeFallback { new_size, .. } = &event {
                    batch_size.store(*new_size, Ordering::SeqCst);
                }
                let _ = events.send(event);
            }
        }
    }
    let abandoned = pending.fail_all();
    if abandoned > 0 {
        tracing::warn!(abandoned, "Embedding worker exited with calls in flight");
    }
}

fn run_worker_thread(
    embedder: Arc<dyn Embedder>,
    requests: flume::Receiver<Envelope>,
    messages: flume::Sender<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start embedding worker runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut notifications = embedder.subscribe();
        let forward = messages.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = notifications.recv().await {
                if forward.send(WorkerMessage::Notification(event)).is_err() {
                    break;
                }
            }
        });

        while let Ok(Envelope { id, request }) = requests.recv_async().await {
            let dispose = matches!(request, WorkerRequest::Dispose);
            let result = handle_request(embedder.as_ref(), request).await;
            // Let queued notifications go out before the reply.
            tokio::task::yield_now().await;
            if messages.send(WorkerMessage::Response { id, result }).is_err() || dispose {
                break;
            }
        }

        forwarder.abort();
        tracing::debug!(embedder = embedder.name(), "Embedding worker stopped");
    });
}

async fn handle_request(embedder: &dyn Embedder, request: WorkerRequest) -> Result<WorkerReply> {
    match request {
        WorkerRequest::Initialize => embedder.initialize().await.map(|_| WorkerReply::Done),
        WorkerRequest::Embed { text } => embedder.embed(&text).await.map(WorkerReply::Vector),
        WorkerRequest::EmbedBatch { texts } => {
            embedder.embed_batch(&texts).await.map(WorkerReply::Vectors)
        }
        WorkerRequest::EmbedQuery { text } => {
            embedder.embed_query(&text).await.map(WorkerReply::Vector)
        }
        WorkerRequest::EmbedDocument { text } => {
            embedder.embed_document(&text).await.map(WorkerReply::Vector)
        }
        WorkerRequest::EmbedBatchDocuments { texts } => embedder
            .embed_batch_documents(&texts)
            .await
            .map(WorkerReply::Vectors),
        WorkerRequest::IsReady => Ok(WorkerReply::Ready(embedder.is_ready())),
        WorkerRequest::ResetBatchSize => {
            embedder.reset_batch_size();
            Ok(WorkerReply::Done)
        }
        WorkerRequest::Dispose => embedder.dispose().await.map(|_| WorkerReply::Done),
    }
}

#[async_trait]
impl Embedder for EmbedderWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn initialize(&self) -> Result<()> {
        self.call(WorkerRequest::Initialize).await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .call_vector(WorkerRequest::Embed {
                text: text.to_string(),
            })
            .await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self
            .call_vectors(WorkerRequest::EmbedBatch {
                texts: texts.to_vec(),
            })
            .await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(vectors)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.call_vector(WorkerRequest::EmbedQuery {
            text: text.to_string(),
        })
        .await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.call_vector(WorkerRequest::EmbedDocument {
            text: text.to_string(),
        })
        .await
    }

    async fn embed_batch_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.call_vectors(WorkerRequest::EmbedBatchDocuments {
            texts: texts.to_vec(),
        })
        .await
    }

    fn current_batch_size(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    fn reset_batch_size(&self) {
        self.batch_size
            .store(self.configured_batch_size, Ordering::SeqCst);
        // Fire and forget: the worker applies it before any later request.
        let _ = self.requests.send(Envelope {
            id: PendingCalls::<()>::next_id(),
            request: WorkerRequest::ResetBatchSize,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<EmbedderEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) -> Result<()> {
        let result = self.call(WorkerRequest::Dispose).await;
        self.ready.store(false, Ordering::SeqCst);
        match result {
            Ok(_) | Err(EmbedError::WorkerClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedConfig;
    use crate::provider::ModelEmbedder;

    fn worker() -> EmbedderWorker {
        let inner = Arc::new(ModelEmbedder::new("hash", EmbedConfig::hashed(24)).unwrap());
        EmbedderWorker::spawn(inner, Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_worker_matches_direct_embedding() -> anyhow::Result<()> {
        let direct = ModelEmbedder::new("hash", EmbedConfig::hashed(24))?;
        let worker = worker();
        assert!(!worker.is_ready());
        worker.initialize().await?;
        assert!(worker.is_ready());
        assert!(worker.query_ready().await?);

        assert_eq!(worker.embed("alpha").await?, direct.embed("alpha").await?);
        assert_eq!(
            worker.embed_query("alpha").await?,
            direct.embed("query: alpha").await?
        );
        let texts = vec!["one".to_string(), "two".to_string()];
        assert_eq!(
            worker.embed_batch_documents(&texts).await?,
            direct.embed_batch_documents(&texts).await?
        );
        assert_eq!(worker.dimensions(), 24);
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_forwards_progress() -> anyhow::Result<()> {
        let worker = worker();
        let mut rx = worker.subscribe();
        worker.initialize().await?;
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await??;
        assert!(matches!(event, EmbedderEvent::Progress { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_closes_worker() -> anyhow::Result<()> {
        let worker = worker();
        worker.initialize().await?;
        worker.dispose().await?;
        assert!(!worker.is_ready());
        let err = worker.embed("after").await.unwrap_err();
        assert!(matches!(err, EmbedError::WorkerClosed));
        Ok(())
    }
}
