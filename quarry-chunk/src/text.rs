//! Recursive, boundary-aware text chunking.
//!
//! The [`RecursiveChunker`] breaks text into "atomic" segments by trying a list
//! of delimiter patterns from most to least significant, descending to the next
//! delimiter only for segments that are still larger than the maximum chunk
//! size. Segments that survive every delimiter are cut at character boundaries.
//! The segments are then packed greedily into chunks, and each new chunk
//! re-includes trailing segments of the previous one to provide overlap.
//!
//! # Key Features
//!
//! *   **Boundary preference**: paragraphs first, then sentences, then hard cuts.
//! *   **Exact slices**: every chunk is a verbatim slice of the input with
//!     character offsets, so chunks can be mapped back onto the document.
//! *   **Overlap**: consecutive chunks share up to `chunk_overlap` characters.
//! *   **Sections**: Markdown headings before a chunk become its `section`.
//!
//! # Usage
//!
//! ```
//! use quarry_chunk::{ChunkOptions, Chunker, RecursiveChunker};
//!
//! let chunker = RecursiveChunker::default();
//! let text = "# Title\n\nFirst paragraph.\n\nSecond paragraph.";
//! let chunks = chunker.chunk(text, &ChunkOptions::new(24, 0)).unwrap();
//!
//! assert!(chunks.len() > 1);
//! assert!(chunks.iter().all(|c| c.text.chars().count() <= 24));
//! assert_eq!(chunks[1].section.as_deref(), Some("Title"));
//! ```
use crate::chunk::{Chunk, ChunkOptions, Chunker, CharIndex, build_chunks};
use crate::error::{ChunkError, Result};
use regex::Regex;
use std::ops::Range;

/// Default delimiter patterns, most significant first.
///
/// - `\n[ \t]*\n\s*`: paragraph breaks (blank lines).
/// - `[.!?]+["')\]]*\s+`: sentence endings followed by whitespace.
pub const DEFAULT_DELIMITERS: &[&str] = &[
    r"\n[ \t]*\n\s*",     // Paragraphs
    r#"[.!?]+["')\]]*\s+"#, // Sentences
];

/// Delimiters that also respect Markdown structure before falling back to
/// paragraphs and sentences.
pub const MARKDOWN_DELIMITERS: &[&str] = &[
    r"(?m)^#{1,6}[ \t]+.*$", // Headings
    r"```",                  // Code block fences
    r"\n[ \t]*\n\s*",        // Paragraphs
    r#"[.!?]+["')\]]*\s+"#,  // Sentences
];

/// Chunker that splits recursively on progressively finer delimiters.
pub struct RecursiveChunker {
    name: String,
    delimiters: Vec<Regex>,
}

impl Default for RecursiveChunker {
    fn default() -> Self {
        Self::with_delimiters("recursive", DEFAULT_DELIMITERS)
            .expect("default delimiter patterns are valid")
    }
}

impl RecursiveChunker {
    /// Creates a chunker with custom delimiter patterns.
    ///
    /// # Arguments
    /// * `name` - Registry name for this chunker
    /// * `patterns` - Regular expressions ordered from most to least significant
    ///
    /// # Returns
    /// The chunker, or [`ChunkError::InvalidOption`] if a pattern does not compile.
    pub fn with_delimiters(name: impl Into<String>, patterns: &[&str]) -> Result<Self> {
        let delimiters = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ChunkError::invalid_option(format!("invalid delimiter '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            delimiters,
        })
    }

    /// Byte ranges of the packed chunks, before whitespace-only filtering.
    fn chunk_ranges(
        &self,
        text: &str,
        index: &CharIndex,
        options: &ChunkOptions,
    ) -> Vec<Range<usize>> {
        let mut segments = Vec::new();
        let max = options.max_chunk_size;
        self.split_recursively_into_segments(text, 0, 0, index, max, &mut segments);
        pack_segments(&segments, index, options)
    }

    // Splits `text` (which starts at byte `offset` of the full input) into
    // segments no longer than `max_chars`. Delimiter matches stay attached as
    // their own segments so the segments tile the input exactly.
    fn split_recursively_into_segments(
        &self,
        text: &str,
        offset: usize,
        delimiter_idx: usize,
        index: &CharIndex,
        max_chars: usize,
        out: &mut Vec<Range<usize>>,
    ) {
        if text.is_empty() {
            return;
        }
        let range = offset..offset + text.len();
        if index.char_len(&range) <= max_chars {
            out.push(range);
            return;
        }

        let Some(delimiter) = self.delimiters.get(delimiter_idx) else {
            hard_cut(range, index, max_chars, out);
            return;
        };

        let mut local_start = 0;
        let mut split = false;
        for mat in delimiter.find_iter(text) {
            if mat.is_empty() {
                continue;
            }
            split = true;
            if mat.start() > local_start {
                self.split_recursively_into_segments(
                    &text[local_start..mat.start()],
                    offset + local_start,
                    delimiter_idx + 1,
                    index,
                    max_chars,
                    out,
                );
            }
            let delim_range = offset + mat.start()..offset + mat.end();
            if index.char_len(&delim_range) <= max_chars {
                out.push(delim_range);
            } else {
                hard_cut(delim_range, index, max_chars, out);
            }
            local_start = mat.end();
        }

        if !split {
            self.split_recursively_into_segments(
                text,
                offset,
                delimiter_idx + 1,
                index,
                max_chars,
                out,
            );
            return;
        }
        if local_start < text.len() {
            self.split_recursively_into_segments(
                &text[local_start..],
                offset + local_start,
                delimiter_idx + 1,
                index,
                max_chars,
                out,
            );
        }
    }
}

impl Chunker for RecursiveChunker {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        10
    }

    fn chunk(&self, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>> {
        options.validate()?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index = CharIndex::new(text);
        if index.char_count() <= options.max_chunk_size {
            return Ok(build_chunks(text, [0..text.len()], &index, options));
        }
        let ranges = self.chunk_ranges(text, &index, options);
        Ok(build_chunks(text, ranges, &index, options))
    }
}

/// Cut a byte range into pieces of at most `max_chars` characters.
fn hard_cut(range: Range<usize>, index: &CharIndex, max_chars: usize, out: &mut Vec<Range<usize>>) {
    let mut start_char = index.to_char(range.start);
    let end_char = index.to_char(range.end);
    while start_char < end_char {
        let next = (start_char + max_chars).min(end_char);
        out.push(index.to_byte(start_char)..index.to_byte(next));
        start_char = next;
    }
}

/// Greedily pack contiguous segments into chunks of at most `max_chunk_size`
/// characters, starting each chunk after the first with up to `chunk_overlap`
/// characters of trailing segments from its predecessor.
fn pack_segments(
    segments: &[Range<usize>],
    index: &CharIndex,
    options: &ChunkOptions,
) -> Vec<Range<usize>> {
    let lens: Vec<usize> = segments.iter().map(|s| index.char_len(s)).collect();
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut covered = 0;

    while start < segments.len() {
        let mut end = start;
        let mut len = 0;
        while end < segments.len() && len + lens[end] <= options.max_chunk_size {
            len += lens[end];
            end += 1;
        }
        if end <= covered {
            // The overlap left no room for new content; restart without it.
            start = covered;
            continue;
        }
        ranges.push(segments[start].start..segments[end - 1].end);
        if end == segments.len() {
            break;
        }
        covered = end;

        let mut next = end;
        let mut overlap = 0;
        while next > start + 1 && overlap + lens[next - 1] <= options.chunk_overlap {
            next -= 1;
            overlap += lens[next];
        }
        start = next;
    }

    ranges
}
