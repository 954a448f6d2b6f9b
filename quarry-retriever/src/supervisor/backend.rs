//! Where the supervised engine runs.
//!
//! [`InProcessBackend`] holds the engine directly and "restarts" by closing
//! and re-opening it. [`ChildProcessBackend`] runs `quarry child` and talks
//! to it over the JSONL protocol; restarting it replaces the process, which
//! is the only way to return allocator memory to the system.

use super::SupervisorConfig;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::QuarryError;
use crate::events::EngineEvent;
use crate::ipc::child::result_value;
use crate::ipc::{ChildMessage, EngineCall, HostMessage, MessageReader, MessageWriter, execute};
use crate::memory::MemoryProbe;
use anyhow::{Context, Result};
use async_trait::async_trait;
use quarry_embed::{CallError, PendingCalls};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

#[async_trait]
pub trait IndexingBackend: Send + Sync {
    /// Bring the engine up. Called again after [`IndexingBackend::stop`].
    async fn start(&mut self) -> Result<()>;

    async fn call(&mut self, call: EngineCall) -> Result<Value>;

    /// Tear the engine down; safe to call when not started.
    async fn stop(&mut self) -> Result<()>;

    /// Process hosting the engine.
    fn pid(&self) -> Option<u32>;

    /// Latest resident memory estimate in MiB.
    fn memory_mb(&mut self) -> Option<u64>;

    /// False once the backend has seen a fatal error or a timed-out call.
    fn is_healthy(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Runs the engine inside the supervisor's own process.
pub struct InProcessBackend {
    root: PathBuf,
    config: EngineConfig,
    engine: Option<Engine>,
    forwarders: Vec<JoinHandle<()>>,
    events: broadcast::Sender<EngineEvent>,
    probe: MemoryProbe,
}

impl InProcessBackend {
    pub fn new(root: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            root: root.into(),
            config,
            engine: None,
            forwarders: Vec::new(),
            events: broadcast::channel(256).0,
            probe: MemoryProbe::new(),
        }
    }
}

#[async_trait]
impl IndexingBackend for InProcessBackend {
    async fn start(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let engine = Engine::initialize(&self.root, self.config.clone()).await?;
        let events = self.events.clone();
        self.forwarders = engine.events().forward(engine.subscribe_embedder(), move |event| {
            let _ = events.send(event);
        });
        self.engine = Some(engine);
        Ok(())
    }

    async fn call(&mut self, call: EngineCall) -> Result<Value> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| QuarryError::protocol(format!("{} called before start", call.method())))?;
        execute(engine, call).await
    }

    async fn stop(&mut self) -> Result<()> {
        let closed = match self.engine.take() {
            Some(engine) => engine.close().await,
            None => Ok(()),
        };
        for mut handle in self.forwarders.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        closed
    }

    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn memory_mb(&mut self) -> Option<u64> {
        self.probe.read_self().map(|report| report.rss_mb)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

type Reply = Result<Value, QuarryError>;

/// State shared between the backend and the task reading the child's stdout.
struct ChildLink {
    pending: PendingCalls<Reply>,
    events: broadcast::Sender<EngineEvent>,
    /// Signalled by the unsolicited startup `ready`.
    started: Notify,
    healthy: AtomicBool,
    reported_rss_mb: AtomicU64,
}

impl ChildLink {
    fn handle(&self, message: ChildMessage) {
        match message {
            ChildMessage::Ready { id: None, pid } => {
                tracing::debug!(pid, "Child started");
                self.started.notify_one();
            }
            ChildMessage::Ready { id: Some(id), .. } => {
                self.pending.complete(&id, Ok(Value::Null));
            }
            ChildMessage::Result { id, ok, value, error } => {
                if !self.pending.complete(&id, result_value(ok, value, error)) {
                    tracing::debug!(%id, "Late or unknown result ignored");
                }
            }
            ChildMessage::Pong { id: Some(id) } | ChildMessage::ShuttingDown { id: Some(id) } => {
                self.pending.complete(&id, Ok(Value::Null));
            }
            ChildMessage::Pong { id: None } | ChildMessage::ShuttingDown { id: None } => {}
            ChildMessage::Event { event } => {
                let _ = self.events.send(event);
            }
            ChildMessage::Memory { rss_mb, .. } => {
                self.reported_rss_mb.store(rss_mb, Ordering::Relaxed);
            }
            ChildMessage::Error { id, message, fatal } => {
                if fatal {
                    tracing::error!(%message, "Child reported a fatal error");
                    self.healthy.store(false, Ordering::SeqCst);
                } else {
                    tracing::warn!(%message, "Child reported an error");
                }
                let error = if fatal {
                    QuarryError::Fatal(message)
                } else {
                    QuarryError::protocol(message)
                };
                match id {
                    Some(id) => {
                        self.pending.complete(&id, Err(error));
                    }
                    None if fatal => {
                        self.pending.fail_all();
                    }
                    None => {}
                }
            }
        }
    }
}

struct Running {
    child: Child,
    stdin: MessageWriter<ChildStdin>,
    reader: JoinHandle<()>,
    pid: Option<u32>,
}

/// Runs the engine in a `quarry child` process.
pub struct ChildProcessBackend {
    root: PathBuf,
    config: EngineConfig,
    supervisor: SupervisorConfig,
    link: Arc<ChildLink>,
    running: Option<Running>,
    probe: MemoryProbe,
}

impl ChildProcessBackend {
    pub fn new(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        supervisor: SupervisorConfig,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            supervisor,
            link: Arc::new(ChildLink {
                pending: PendingCalls::new(),
                events: broadcast::channel(256).0,
                started: Notify::new(),
                healthy: AtomicBool::new(true),
                reported_rss_mb: AtomicU64::new(0),
            }),
            running: None,
            probe: MemoryProbe::new(),
        }
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.supervisor.child_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().context("Failed to locate the quarry executable"),
        }
    }

    async fn spawn(&mut self) -> Result<()> {
        let program = self.program()?;
        let mut command = Command::new(&program);
        command
            .args(&self.supervisor.child_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;
        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let pid = child.id();

        self.link.healthy.store(true, Ordering::SeqCst);
        self.link.reported_rss_mb.store(0, Ordering::Relaxed);
        let started = self.link.started.notified();
        tokio::pin!(started);
        started.as_mut().enable();

        let link = Arc::clone(&self.link);
        let reader = tokio::spawn(async move {
            let mut reader = MessageReader::new(stdout);
            loop {
                match reader.next::<ChildMessage>().await {
                    Ok(Some(Ok(message))) => link.handle(message),
                    Ok(Some(Err(e))) => tracing::warn!(error = %e, "Ignoring malformed child frame"),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read from child");
                        break;
                    }
                }
            }
            link.healthy.store(false, Ordering::SeqCst);
            let dropped = link.pending.fail_all();
            tracing::debug!(dropped, "Child output closed");
        });

        self.running = Some(Running {
            child,
            stdin: MessageWriter::new(stdin),
            reader,
            pid,
        });

        tokio::time::timeout(self.supervisor.startup_timeout(), started)
            .await
            .map_err(|_| QuarryError::RuntimeFailure("child did not report ready".into()))?;
        tracing::info!(pid = ?pid, "Child process started");
        Ok(())
    }

    /// Send a frame built around a fresh correlation id and wait for its reply.
    async fn request(
        &mut self,
        build: impl FnOnce(String) -> HostMessage,
        timeout: Duration,
    ) -> Result<Value> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| QuarryError::protocol("child process not running"))?;
        let (id, rx) = self.link.pending.register();
        let message = build(id.clone());
        if let Err(e) = running.stdin.send(&message).await {
            self.link.pending.cancel(&id);
            self.link.healthy.store(false, Ordering::SeqCst);
            return Err(e.context("Failed to write to child"));
        }
        match self.link.pending.wait(&id, rx, timeout).await {
            Ok(reply) => Ok(reply?),
            Err(CallError::TimedOut(after)) => {
                self.link.healthy.store(false, Ordering::SeqCst);
                Err(QuarryError::RuntimeFailure(format!("child call timed out after {after:?}")).into())
            }
            Err(CallError::Closed) => {
                Err(QuarryError::Fatal("child exited before replying".into()).into())
            }
        }
    }
}

#[async_trait]
impl IndexingBackend for ChildProcessBackend {
    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.spawn().await?;
        let root = self.root.clone();
        let config = Box::new(self.config.clone());
        let memory_interval_ms = self.supervisor.memory_report_ms;
        let result = self
            .request(
                |id| HostMessage::Init {
                    id,
                    root,
                    database: None,
                    config,
                    memory_interval_ms,
                },
                self.supervisor.startup_timeout(),
            )
            .await;
        if let Err(e) = result {
            self.stop().await?;
            return Err(e.context("Child failed to initialize"));
        }
        Ok(())
    }

    async fn call(&mut self, call: EngineCall) -> Result<Value> {
        let (method, args) = call.to_wire()?;
        self.request(
            |id| HostMessage::Call { id, method, args },
            self.supervisor.call_timeout(),
        )
        .await
    }

    async fn stop(&mut self) -> Result<()> {
        if self.running.is_none() {
            return Ok(());
        }
        if self.link.healthy.load(Ordering::SeqCst) {
            match self.call(EngineCall::GetQueueStatus).await {
                Ok(queue) => tracing::debug!(queue = %queue, "Queue state before child shutdown"),
                Err(e) => tracing::debug!(error = %e, "Could not read queue state before shutdown"),
            }
            if let Err(e) = self
                .request(|id| HostMessage::Shutdown { id }, self.supervisor.shutdown_timeout())
                .await
            {
                tracing::warn!(error = %e, "Child did not acknowledge shutdown");
            }
        }

        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        drop(running.stdin);
        match tokio::time::timeout(self.supervisor.shutdown_timeout(), running.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(pid = ?running.pid, %status, "Child process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for child"),
            Err(_) => {
                tracing::warn!(pid = ?running.pid, "Child did not exit in time; killing it");
                running.child.kill().await.context("Failed to kill child process")?;
            }
        }
        if let Err(e) = running.reader.await {
            tracing::warn!(error = %e, "Child reader task panicked");
        }
        self.link.pending.fail_all();
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    fn memory_mb(&mut self) -> Option<u64> {
        let reported = self.link.reported_rss_mb.load(Ordering::Relaxed);
        if reported > 0 {
            return Some(reported);
        }
        let pid = self.pid()?;
        self.probe.read(pid).map(|report| report.rss_mb)
    }

    fn is_healthy(&self) -> bool {
        self.running.is_some() && self.link.healthy.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.link.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> ChildLink {
        ChildLink {
            pending: PendingCalls::new(),
            events: broadcast::channel(8).0,
            started: Notify::new(),
            healthy: AtomicBool::new(true),
            reported_rss_mb: AtomicU64::new(0),
        }
    }

    #[tokio::test]
    async fn test_link_routes_replies_by_id() -> Result<()> {
        let link = link();
        let (id, rx) = link.pending.register();
        link.handle(ChildMessage::success(id.clone(), serde_json::json!(3)));
        assert_eq!(rx.await??, serde_json::json!(3));

        let (id, rx) = link.pending.register();
        link.handle(ChildMessage::Error {
            id: Some(id),
            message: "bad".into(),
            fatal: false,
        });
        assert!(matches!(rx.await?, Err(QuarryError::ProtocolError(_))));
        assert!(link.healthy.load(Ordering::SeqCst));

        link.handle(ChildMessage::Memory {
            rss_mb: 700,
            virtual_mb: 900,
        });
        assert_eq!(link.reported_rss_mb.load(Ordering::Relaxed), 700);
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_error_fails_pending_calls() {
        let link = link();
        let (_id, rx) = link.pending.register();
        link.handle(ChildMessage::Error {
            id: None,
            message: "allocator exhausted".into(),
            fatal: true,
        });
        assert!(rx.await.is_err());
        assert!(!link.healthy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_in_process_call_before_start_fails() {
        let mut backend = InProcessBackend::new("/tmp", EngineConfig::for_testing());
        let err = backend.call(EngineCall::GetStats).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::ProtocolError(_))
        ));
        assert!(backend.stop().await.is_ok());
    }
}
