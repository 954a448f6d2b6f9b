use crate::chunk::{Chunk, ChunkOptions, Chunker, CharIndex, build_chunks};
use crate::error::Result;

/// Splits text into fixed-length character windows with overlap.
///
/// No boundary awareness; used as a fast fallback when the recursive chunker
/// is unsuitable (minified files, logs, very long single lines).
#[derive(Debug, Default, Clone)]
pub struct FixedSizeChunker;

impl Chunker for FixedSizeChunker {
    fn name(&self) -> &str {
        "fixed"
    }

    fn chunk(&self, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>> {
        options.validate()?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index = CharIndex::new(text);
        let total = index.char_count();
        let step = options.max_chunk_size - options.chunk_overlap;

        let mut ranges = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + options.max_chunk_size).min(total);
            ranges.push(index.to_byte(start)..index.to_byte(end));
            if end == total {
                break;
            }
            start += step;
        }
        Ok(build_chunks(text, ranges, &index, options))
    }
}
