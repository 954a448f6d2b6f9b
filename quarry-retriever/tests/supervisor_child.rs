//! Supervised indexing against a real child process
//!
//! The child is this package's own `quarry child` binary, so these tests cover
//! the JSONL protocol end to end: startup, init, calls, forwarded events,
//! restarts and shutdown.

use anyhow::Result;
use quarry_retriever::config::EngineConfig;
use quarry_retriever::engine::IndexOptions;
use quarry_retriever::events::{EngineEvent, IndexingEvent};
use quarry_retriever::ipc::EngineCall;
use quarry_retriever::storage::IndexStats;
use quarry_retriever::supervisor::{RestartStrategy, Supervisor, SupervisorConfig, SupervisorStatus};
use std::path::Path;
use tempfile::tempdir;

fn child_config(restart_threshold: u64) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_strategy(RestartStrategy::ChildProcess)
        .with_restart_threshold(restart_threshold)
        .with_memory_threshold_mb(0)
        .with_child_program(env!("CARGO_BIN_EXE_quarry"), vec!["child".into()])
}

async fn write_files(root: &Path, count: usize) -> Result<()> {
    for i in 0..count {
        tokio::fs::write(
            root.join(format!("file_{i}.txt")),
            format!("Document number {i} about sandstone and limestone."),
        )
        .await?;
    }
    Ok(())
}

/// A restart threshold of one document forces a fresh child between batches
#[tokio::test]
async fn test_child_restarts_between_batches() -> Result<()> {
    let dir = tempdir()?;
    write_files(dir.path(), 3).await?;
    let root = dir.path().canonicalize()?;
    let mut supervisor = Supervisor::new(&root, EngineConfig::for_testing(), child_config(1));
    let mut events = supervisor.subscribe_events();

    let summary = supervisor.index_all(&IndexOptions::default()).await?;
    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.failed, 0);

    let state = supervisor.state();
    assert_eq!(state.status, SupervisorStatus::Running);
    assert!(state.restart_count >= 1);
    assert_eq!(state.total_documents, 3);
    assert!(state.child_pid.is_some());

    let mut indexed_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::Indexing(IndexingEvent::FileIndexed { .. })) {
            indexed_events += 1;
        }
    }
    assert_eq!(indexed_events, 3);

    let stats: IndexStats = serde_json::from_value(supervisor.call(EngineCall::GetStats).await?)?;
    assert_eq!(stats.indexed_documents, 3);

    supervisor.stop().await?;
    assert_eq!(supervisor.state().status, SupervisorStatus::Idle);
    Ok(())
}

/// Errors raised inside the child come back as typed errors and leave the
/// child usable
#[tokio::test]
async fn test_child_reports_call_errors() -> Result<()> {
    let dir = tempdir()?;
    write_files(dir.path(), 1).await?;
    let mut supervisor = Supervisor::new(dir.path().canonicalize()?, EngineConfig::for_testing(), child_config(0));
    supervisor.index_all(&IndexOptions::default()).await?;

    let err = supervisor
        .call(EngineCall::Search {
            query: "\"unclosed".into(),
            options: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid option"), "{err:#}");

    let value = supervisor.call(EngineCall::NeedsSync).await?;
    assert_eq!(value, serde_json::Value::Bool(false));
    assert_eq!(supervisor.state().restart_count, 0);
    supervisor.stop().await
}
