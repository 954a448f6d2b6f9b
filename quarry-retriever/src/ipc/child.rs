//! The child side of the supervisor protocol (`quarry child`).
//!
//! Reads [`HostMessage`] frames from `input`, hosts one [`Engine`], and
//! writes [`ChildMessage`] frames to `output`. All writes go through a single
//! writer task so forwarded events, memory reports and call results never
//! interleave within a line. Calls run as separate tasks, which keeps `ping`
//! answerable while a batch is indexing.

use super::{
    ChildMessage, EngineCall, HostMessage, MessageReader, MessageWriter, WireError, execute,
};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{ErrorKind, QuarryError};
use crate::memory::MemoryProbe;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

type Outbox = mpsc::UnboundedSender<ChildMessage>;

/// How long event forwarders may take to drain once the engine is closed.
const FORWARDER_DRAIN: Duration = Duration::from_secs(1);

struct Session {
    engine: Arc<Engine>,
    forwarders: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl Session {
    async fn close(self, calls: &mut JoinSet<()>) {
        while calls.join_next().await.is_some() {}
        if let Some(reporter) = &self.reporter {
            reporter.abort();
        }
        match Arc::try_unwrap(self.engine) {
            Ok(engine) => {
                if let Err(e) = engine.close().await {
                    tracing::warn!(error = %e, "Failed to close engine");
                }
            }
            Err(_) => tracing::warn!("Engine still referenced at shutdown; dropping it"),
        }
        // Forwarders finish on their own once the engine's senders are gone.
        for mut handle in self.forwarders {
            if tokio::time::timeout(FORWARDER_DRAIN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

fn send(outbox: &Outbox, message: ChildMessage) {
    // The writer only stops once the session is over.
    let _ = outbox.send(message);
}

fn spawn_memory_reporter(outbox: Outbox, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = MemoryProbe::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(report) = probe.read_self() {
                send(
                    &outbox,
                    ChildMessage::Memory {
                        rss_mb: report.rss_mb,
                        virtual_mb: report.virtual_mb,
                    },
                );
            }
        }
    })
}

async fn start_session(
    outbox: &Outbox,
    root: &std::path::Path,
    database: Option<std::path::PathBuf>,
    config: EngineConfig,
    memory_interval_ms: u64,
) -> Result<Session> {
    let config = match database {
        Some(path) => config.with_database_path(path),
        None => config,
    };
    let engine = Arc::new(Engine::initialize(root, config).await?);

    let sink = outbox.clone();
    let forwarders = engine.events().forward(engine.subscribe_embedder(), move |event| {
        send(&sink, ChildMessage::Event { event });
    });
    let reporter = (memory_interval_ms > 0).then(|| {
        spawn_memory_reporter(outbox.clone(), Duration::from_millis(memory_interval_ms))
    });
    if let Some(ocr) = engine.ocr() {
        ocr.start().await;
    }
    Ok(Session {
        engine,
        forwarders,
        reporter,
    })
}

/// Serve the protocol until `shutdown`, end of input or a fatal error.
///
/// # Errors
/// Returns an error when the engine cannot be initialized or a call fails
/// fatally; the caller exits non-zero so the supervisor restarts the child.
pub async fn run_child<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pid = std::process::id();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<ChildMessage>();
    let writer = tokio::spawn(async move {
        let mut writer = MessageWriter::new(output);
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = writer.send(&message).await {
                tracing::error!(error = %e, "Failed to write IPC frame; host is gone");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
    let mut reader = MessageReader::new(input);
    let mut session: Option<Session> = None;
    let mut calls = JoinSet::new();
    send(&outbox, ChildMessage::Ready { id: None, pid });
    tracing::info!(pid, "Child ready");

    let outcome: Result<()> = loop {
        let frame = tokio::select! {
            frame = reader.next::<HostMessage>() => frame,
            Some(message) = fatal_rx.recv() => {
                break Err(QuarryError::Fatal(message).into());
            }
            Some(_) = calls.join_next(), if !calls.is_empty() => continue,
        };
        let message = match frame {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "Ignoring malformed frame");
                send(
                    &outbox,
                    ChildMessage::Error {
                        id: None,
                        message: e.to_string(),
                        fatal: false,
                    },
                );
                continue;
            }
            Ok(None) => {
                tracing::info!("Host closed stdin; exiting");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        match message {
            HostMessage::Ping { id } => send(&outbox, ChildMessage::Pong { id: Some(id) }),
            HostMessage::Init {
                id,
                root,
                database,
                config,
                memory_interval_ms,
            } => {
                if session.is_some() {
                    send(
                        &outbox,
                        ChildMessage::Error {
                            id: Some(id),
                            message: "already initialized".to_string(),
                            fatal: false,
                        },
                    );
                    continue;
                }
                match start_session(&outbox, &root, database, *config, memory_interval_ms).await {
                    Ok(started) => {
                        session = Some(started);
                        send(&outbox, ChildMessage::Ready { id: Some(id), pid });
                    }
                    Err(e) => {
                        tracing::error!(error = %format!("{e:#}"), "Engine initialization failed");
                        send(
                            &outbox,
                            ChildMessage::Error {
                                id: Some(id),
                                message: format!("{e:#}"),
                                fatal: true,
                            },
                        );
                        break Err(e);
                    }
                }
            }
            HostMessage::Call { id, method, args } => {
                let Some(active) = &session else {
                    let error = WireError {
                        kind: ErrorKind::ProtocolError,
                        message: format!("{method} called before init"),
                    };
                    send(&outbox, ChildMessage::failure(id, error));
                    continue;
                };
                let call = match EngineCall::from_wire(&method, args) {
                    Ok(call) => call,
                    Err(e) => {
                        let error = WireError {
                            kind: e.kind(),
                            message: e.message().to_string(),
                        };
                        send(&outbox, ChildMessage::failure(id, error));
                        continue;
                    }
                };
                let engine = Arc::clone(&active.engine);
                let outbox = outbox.clone();
                let fatal = fatal_tx.clone();
                calls.spawn(async move {
                    match execute(&engine, call).await {
                        Ok(value) => send(&outbox, ChildMessage::success(id, value)),
                        Err(e) => {
                            let error = WireError::from_anyhow(&e);
                            let is_fatal = error.kind == ErrorKind::Fatal;
                            send(&outbox, ChildMessage::failure(id, error.clone()));
                            if is_fatal {
                                let _ = fatal.send(error.message);
                            }
                        }
                    }
                });
            }
            HostMessage::Shutdown { id } => {
                tracing::info!("Shutdown requested");
                if let Some(active) = session.take() {
                    active.close(&mut calls).await;
                }
                send(&outbox, ChildMessage::ShuttingDown { id: Some(id) });
                break Ok(());
            }
        }
    };

    if let Err(e) = &outcome {
        send(
            &outbox,
            ChildMessage::Error {
                id: None,
                message: format!("{e:#}"),
                fatal: true,
            },
        );
    }
    if let Some(active) = session.take() {
        calls.abort_all();
        active.close(&mut calls).await;
    }
    drop(outbox);
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "IPC writer panicked");
    }
    outcome
}

/// Value of a `result` frame, or the error it carries.
pub fn result_value(
    ok: bool,
    value: Value,
    error: Option<WireError>,
) -> Result<Value, QuarryError> {
    if ok {
        Ok(value)
    } else {
        Err(error
            .map(WireError::into_error)
            .unwrap_or_else(|| QuarryError::RuntimeFailure("call failed without an error".into())))
    }
}
