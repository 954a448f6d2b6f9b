//! quarry-retriever: local document indexing and hybrid search
//!
//! This crate indexes the documents of one workspace directory into a SQLite
//! database and answers keyword, semantic and hybrid queries against it. It is
//! built to run for a long time next to an agent: indexing can be supervised
//! and moved into a disposable child process so the memory held by model
//! runtimes is returned to the system on every restart.
//!
//! ## Key Modules
//!
//! - **[`engine`]**: the handle that owns every component of one workspace
//! - **[`storage`]**: SQLite schema, FTS5 keyword index and the vector index
//! - **[`search`]**: web-search query translation and keyword/semantic/hybrid search
//! - **[`pipeline`]**: parse → chunk → embed → store for queued files
//! - **[`sync`]**: startup reconciliation and the live file watcher
//! - **[`ocr`]**: OCR providers and the background job queue
//! - **[`supervisor`]**: restart thresholds and the in-process/child-process backends
//! - **[`ipc`]**: the line-delimited JSON protocol spoken with the child
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_retriever::config::EngineConfig;
//! use quarry_retriever::engine::{Engine, IndexOptions};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let root = Path::new(".");
//! let engine = Engine::initialize(root, EngineConfig::load(root).await?).await?;
//! engine.index_all(&IndexOptions::default()).await?;
//! let response = engine.search_default("\"error handling\" -panic").await?;
//! for hit in response.results {
//!     println!("{:.3} {}", hit.score, hit.file_path);
//! }
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Supervisor ──JSONL──► child: Engine
//!                               │
//! FileWatcher / StartupSync ──► index_queue ──► IndexingPipeline ──► SqliteStore
//!                                                 │    │     │           ▲
//!                                          Parser Chunkers Embedder      │
//!                                                 └──► OcrQueueManager ──┘
//! SearchService ◄──────────────────────────────────────────────── SqliteStore
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod ocr;
pub mod parser;
pub mod pipeline;
pub mod search;
pub mod storage;
pub mod supervisor;
pub mod sync;
