//! # quarry-chunk
//!
//! Text chunking for the quarry indexing engine.
//!
//! ## Key Components
//!
//! - **[`Chunker`]**: the pluggable splitter interface
//! - **[`RecursiveChunker`]**: paragraph → sentence → hard-cut splitting with overlap
//!   and Markdown section tracking
//! - **[`FixedSizeChunker`]**: fixed character windows, a fast fallback
//! - **[`ChunkerRegistry`]**: named chunkers with a default
//!
//! ## Usage
//!
//! ```
//! use quarry_chunk::{ChunkOptions, ChunkerRegistry};
//!
//! let registry = ChunkerRegistry::with_defaults();
//! let chunks = registry.chunk("Some document text.", &ChunkOptions::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! ```

pub mod chunk;
pub mod error;
pub mod fixed;
pub mod registry;
pub mod text;

pub use chunk::{Chunk, ChunkOptions, Chunker, estimate_tokens};
pub use error::{ChunkError, Result};
pub use fixed::FixedSizeChunker;
pub use registry::ChunkerRegistry;
pub use text::{DEFAULT_DELIMITERS, MARKDOWN_DELIMITERS, RecursiveChunker};

/// Pick delimiter patterns for a file path: Markdown-aware for Markdown and
/// plain-text documents, paragraph/sentence for everything else.
pub fn delimiters_for_path(path: &std::path::Path) -> &'static [&'static str] {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("md") | Some("markdown") | Some("mdx") => MARKDOWN_DELIMITERS,
        _ => DEFAULT_DELIMITERS,
    }
}
