//! Engine operations that can be invoked remotely.
//!
//! On the wire a call is a method name plus a JSON `args` value; in Rust it is
//! an [`EngineCall`]. Both supervisor backends run calls through
//! [`execute`], so the in-process and child-process paths behave the same.

use crate::engine::{Engine, IndexOptions};
use crate::error::QuarryError;
use crate::search::SearchOptions;
use crate::sync::SyncOptions;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum EngineCall {
    Sync(SyncOptions),
    NeedsSync,
    ProcessBatch,
    IndexAll(IndexOptions),
    Search {
        query: String,
        #[serde(default)]
        options: Option<SearchOptions>,
    },
    GetStats,
    GetQueueStatus,
    ReindexFile {
        path: PathBuf,
    },
    RunOcr,
    OcrStatus,
}

impl EngineCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::NeedsSync => "needs_sync",
            Self::ProcessBatch => "process_batch",
            Self::IndexAll(_) => "index_all",
            Self::Search { .. } => "search",
            Self::GetStats => "get_stats",
            Self::GetQueueStatus => "get_queue_status",
            Self::ReindexFile { .. } => "reindex_file",
            Self::RunOcr => "run_ocr",
            Self::OcrStatus => "ocr_status",
        }
    }

    /// Split into the `method` and `args` of a `call` frame.
    pub fn to_wire(&self) -> Result<(String, Value), QuarryError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| QuarryError::protocol(format!("unencodable call: {e}")))?;
        let args = value
            .as_object_mut()
            .and_then(|object| object.remove("args"))
            .unwrap_or(Value::Null);
        Ok((self.method().to_string(), args))
    }

    /// Rebuild a call from a `call` frame.
    pub fn from_wire(method: &str, args: Value) -> Result<Self, QuarryError> {
        let mut frame = json!({ "method": method });
        if !args.is_null() {
            frame["args"] = args;
        }
        serde_json::from_value(frame)
            .map_err(|e| QuarryError::protocol(format!("bad call to {method}: {e}")))
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run `call` against `engine` and serialize the result.
pub async fn execute(engine: &Engine, call: EngineCall) -> Result<Value> {
    tracing::debug!(method = call.method(), "Executing engine call");
    match call {
        EngineCall::Sync(options) => to_value(engine.sync(&options).await?),
        EngineCall::NeedsSync => to_value(engine.needs_sync().await),
        EngineCall::ProcessBatch => to_value(engine.process_batch().await?),
        EngineCall::IndexAll(options) => to_value(engine.index_all(&options).await?),
        EngineCall::Search { query, options } => {
            let options =
                options.unwrap_or_else(|| SearchOptions::from_config(&engine.config().search));
            to_value(engine.search(&query, &options).await?)
        }
        EngineCall::GetStats => to_value(engine.get_stats().await?),
        EngineCall::GetQueueStatus => to_value(engine.get_queue_status().await?),
        EngineCall::ReindexFile { path } => to_value(engine.reindex_file(&path).await?),
        EngineCall::RunOcr => to_value(engine.run_ocr().await?),
        EngineCall::OcrStatus => to_value(engine.ocr_status().await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() -> Result<()> {
        let calls = vec![
            EngineCall::Sync(SyncOptions {
                dry_run: true,
                ..Default::default()
            }),
            EngineCall::NeedsSync,
            EngineCall::ProcessBatch,
            EngineCall::IndexAll(IndexOptions::default()),
            EngineCall::Search {
                query: "rust -unsafe".into(),
                options: None,
            },
            EngineCall::ReindexFile {
                path: "notes/a.md".into(),
            },
            EngineCall::OcrStatus,
        ];
        for call in calls {
            let (method, args) = call.to_wire()?;
            assert_eq!(method, call.method());
            assert_eq!(EngineCall::from_wire(&method, args)?, call);
        }
        Ok(())
    }

    #[test]
    fn test_unit_calls_have_null_args() -> Result<()> {
        let (method, args) = EngineCall::GetStats.to_wire()?;
        assert_eq!(method, "get_stats");
        assert!(args.is_null());
        Ok(())
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let err = EngineCall::from_wire("drop_tables", Value::Null).unwrap_err();
        assert!(matches!(err, QuarryError::ProtocolError(_)));
        let err = EngineCall::from_wire("reindex_file", json!({"nope": 1})).unwrap_err();
        assert!(matches!(err, QuarryError::ProtocolError(_)));
    }

    #[test]
    fn test_sync_without_args_uses_defaults() -> Result<()> {
        assert_eq!(
            EngineCall::from_wire("sync", json!({}))?,
            EngineCall::Sync(SyncOptions::default())
        );
        Ok(())
    }
}
