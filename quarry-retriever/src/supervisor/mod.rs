//! Lifecycle management for the indexing engine.
//!
//! The embedding and OCR runtimes grow their heap and never give memory back,
//! so long indexing runs are split across engine instances. The supervisor
//! counts documents processed since the last restart and checks the engine's
//! resident memory; before each unit of work it restarts the engine when
//! either threshold is reached.
//!
//! ```text
//! idle ──► starting ──► running ◄──► restarting
//!                          │
//!                          ▼
//!                      stopping ──► idle        (error from any state)
//! ```
//!
//! Work is never lost across a restart: queue rows stay in the database until
//! the pipeline acknowledges them, and rows a killed child had claimed go back
//! to `pending` when the next engine opens the store.

pub mod backend;

pub use backend::{ChildProcessBackend, InProcessBackend, IndexingBackend};

use crate::config::EngineConfig;
use crate::engine::{IndexOptions, IndexSummary};
use crate::events::EngineEvent;
use crate::ipc::EngineCall;
use crate::pipeline::BatchReport;
use crate::sync::SyncOptions;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartStrategy {
    #[default]
    InProcess,
    ChildProcess,
}

impl std::str::FromStr for RestartStrategy {
    type Err = crate::error::QuarryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in-process" => Ok(Self::InProcess),
            "child-process" => Ok(Self::ChildProcess),
            other => Err(crate::error::QuarryError::invalid_option(format!(
                "unknown restart strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub strategy: RestartStrategy,
    /// Documents processed before a restart; 0 disables count-based restarts.
    pub restart_threshold: u64,
    /// Resident memory that forces a restart; 0 disables the check.
    pub memory_threshold_mb: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Interval of the child's memory reports.
    pub memory_report_ms: u64,
    /// Executable for the child; defaults to the running binary.
    pub child_program: Option<PathBuf>,
    pub child_args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            strategy: RestartStrategy::InProcess,
            restart_threshold: 1000,
            memory_threshold_mb: 2048,
            startup_timeout_ms: 120_000,
            shutdown_timeout_ms: 10_000,
            call_timeout_ms: 600_000,
            memory_report_ms: 5_000,
            child_program: None,
            child_args: vec!["child".to_string()],
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn with_strategy(mut self, strategy: RestartStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_restart_threshold(mut self, documents: u64) -> Self {
        self.restart_threshold = documents;
        self
    }

    pub fn with_memory_threshold_mb(mut self, megabytes: u64) -> Self {
        self.memory_threshold_mb = megabytes;
        self
    }

    pub fn with_child_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.child_program = Some(program.into());
        self.child_args = args;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
    Error,
}

impl fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Error => "error",
        })
    }
}

/// Process-wide view of the supervised engine; not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub status: SupervisorStatus,
    pub documents_since_restart: u64,
    pub total_documents: u64,
    pub restart_count: u64,
    pub last_restart: Option<DateTime<Utc>>,
    pub memory_mb: Option<u64>,
    pub child_pid: Option<u32>,
    pub last_error: Option<String>,
}

/// Why a restart was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    DocumentThreshold,
    MemoryThreshold,
    Unhealthy,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DocumentThreshold => "document threshold reached",
            Self::MemoryThreshold => "memory threshold reached",
            Self::Unhealthy => "engine unhealthy",
        })
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    backend: Box<dyn IndexingBackend>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Supervise an engine for `root` with the backend chosen by
    /// `config.strategy`.
    pub fn new(root: impl Into<PathBuf>, engine: EngineConfig, config: SupervisorConfig) -> Self {
        let root = root.into();
        let backend: Box<dyn IndexingBackend> = match config.strategy {
            RestartStrategy::InProcess => Box::new(InProcessBackend::new(root, engine)),
            RestartStrategy::ChildProcess => {
                Box::new(ChildProcessBackend::new(root, engine, config.clone()))
            }
        };
        Self::with_backend(backend, config)
    }

    pub fn with_backend(backend: Box<dyn IndexingBackend>, config: SupervisorConfig) -> Self {
        Self {
            config,
            backend,
            state: watch::Sender::new(SupervisorState::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Engine events, across restarts.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.backend.subscribe()
    }

    fn set_status(&self, status: SupervisorStatus) {
        self.state.send_modify(|state| {
            if state.status != status {
                tracing::debug!(from = %state.status, to = %status, "Supervisor state changed");
            }
            state.status = status;
        });
    }

    fn fail(&self, err: &anyhow::Error) {
        let message = format!("{err:#}");
        tracing::error!(error = %message, "Supervisor entered error state");
        self.state.send_modify(|state| {
            state.status = SupervisorStatus::Error;
            state.last_error = Some(message);
        });
    }

    fn refresh_process_info(&mut self) {
        let memory_mb = self.backend.memory_mb();
        let child_pid = self.backend.pid();
        self.state.send_modify(|state| {
            state.memory_mb = memory_mb;
            state.child_pid = child_pid;
        });
    }

    pub async fn start(&mut self) -> Result<()> {
        let status = self.state.borrow().status;
        if status == SupervisorStatus::Running {
            return Ok(());
        }
        self.set_status(SupervisorStatus::Starting);
        let started = Instant::now();
        if let Err(e) = self.backend.start().await {
            self.fail(&e);
            return Err(e);
        }
        self.refresh_process_info();
        self.set_status(SupervisorStatus::Running);
        tracing::info!(
            strategy = ?self.config.strategy,
            pid = ?self.backend.pid(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Supervisor running"
        );
        Ok(())
    }

    /// The reason the next unit of work must run on a fresh engine, if any.
    pub fn restart_reason(&mut self) -> Option<RestartReason> {
        if !self.backend.is_healthy() {
            return Some(RestartReason::Unhealthy);
        }
        self.refresh_process_info();
        let state = self.state.borrow();
        let documents = self.config.restart_threshold;
        if documents > 0 && state.documents_since_restart >= documents {
            return Some(RestartReason::DocumentThreshold);
        }
        let memory = self.config.memory_threshold_mb;
        match state.memory_mb {
            Some(used) if memory > 0 && used >= memory => Some(RestartReason::MemoryThreshold),
            _ => None,
        }
    }

    /// Replace the engine: stop it, bring up a new one and reset the
    /// per-restart counter.
    pub async fn restart(&mut self, reason: RestartReason) -> Result<()> {
        let before = self.state();
        tracing::info!(
            %reason,
            documents = before.documents_since_restart,
            memory_mb = ?before.memory_mb,
            "Restarting engine"
        );
        self.set_status(SupervisorStatus::Restarting);
        let result = async {
            self.backend.stop().await?;
            self.backend.start().await
        }
        .await;
        if let Err(e) = result {
            self.fail(&e);
            return Err(e);
        }
        self.state.send_modify(|state| {
            state.documents_since_restart = 0;
            state.restart_count += 1;
            state.last_restart = Some(Utc::now());
        });
        self.refresh_process_info();
        self.set_status(SupervisorStatus::Running);
        Ok(())
    }

    async fn ensure_running(&mut self) -> Result<()> {
        let status = self.state.borrow().status;
        match status {
            SupervisorStatus::Running => {}
            SupervisorStatus::Idle | SupervisorStatus::Error => self.start().await?,
            other => {
                return Err(crate::error::QuarryError::invalid_option(format!(
                    "supervisor is {other}"
                ))
                .into());
            }
        }
        if let Some(reason) = self.restart_reason() {
            self.restart(reason).await?;
        }
        Ok(())
    }

    /// Forward one call to the engine.
    pub async fn call(&mut self, call: EngineCall) -> Result<Value> {
        self.ensure_running().await?;
        self.backend.call(call).await
    }

    async fn call_as<T: DeserializeOwned>(&mut self, call: EngineCall) -> Result<T> {
        Ok(serde_json::from_value(self.call(call).await?)?)
    }

    /// Index one batch, restarting first when a threshold was reached.
    pub async fn process_batch(&mut self) -> Result<BatchReport> {
        let report: BatchReport = self.call_as(EngineCall::ProcessBatch).await?;
        let processed = report.processed() as u64;
        self.state.send_modify(|state| {
            state.documents_since_restart += processed;
            state.total_documents += processed;
        });
        Ok(report)
    }

    /// Sync, then drain the queue batch by batch under supervision, then run
    /// OCR.
    pub async fn index_all(&mut self, options: &IndexOptions) -> Result<IndexSummary> {
        let started = Instant::now();
        if options.sync {
            let _: Value = self.call(EngineCall::Sync(SyncOptions::default())).await?;
        }
        let mut summary = IndexSummary::default();
        let mut batches = 0;
        while options.max_batches.is_none_or(|max| batches < max) {
            let report = self.process_batch().await?;
            if report.is_empty() {
                break;
            }
            summary.add(&report);
            batches += 1;
        }
        if options.run_ocr {
            let _: Value = self.call(EngineCall::RunOcr).await?;
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;
        let state = self.state();
        tracing::info!(
            indexed = summary.indexed,
            failed = summary.failed,
            restarts = state.restart_count,
            duration_ms = summary.duration_ms,
            "Supervised indexing finished"
        );
        Ok(summary)
    }

    /// Stop the engine and reset to idle.
    pub async fn stop(&mut self) -> Result<()> {
        self.set_status(SupervisorStatus::Stopping);
        if let Err(e) = self.backend.stop().await {
            self.fail(&e);
            return Err(e);
        }
        self.state.send_replace(SupervisorState::default());
        Ok(())
    }
}
