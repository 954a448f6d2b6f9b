use crate::error::{ChunkError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::OnceLock;

/// A bounded text segment of a document.
///
/// Offsets are character offsets (not bytes) into the original input, so they
/// survive storage in databases that count characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk within its document (0-indexed, consecutive).
    pub index: usize,
    /// The chunk text, an exact slice of the input.
    pub text: String,
    /// Character offset of the first character of the chunk.
    pub start_offset: usize,
    /// Character offset one past the last character of the chunk.
    pub end_offset: usize,
    /// Closest Markdown heading at or before the chunk, when section tracking is on.
    pub section: Option<String>,
    /// Estimated token count derived from the character length.
    pub token_count: usize,
}

/// Options shared by every chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOptions {
    /// Maximum chunk length in characters.
    pub max_chunk_size: usize,
    /// Characters of trailing context repeated at the start of the next chunk.
    pub chunk_overlap: usize,
    /// Populate [`Chunk::section`] from Markdown headings.
    pub track_sections: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            chunk_overlap: 200,
            track_sections: true,
        }
    }
}

impl ChunkOptions {
    pub fn new(max_chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            max_chunk_size,
            chunk_overlap,
            ..Self::default()
        }
    }

    pub fn with_track_sections(mut self, track_sections: bool) -> Self {
        self.track_sections = track_sections;
        self
    }

    /// Rejects a zero chunk size and an overlap that is not strictly smaller
    /// than the chunk size.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(ChunkError::invalid_option(
                "max_chunk_size must be greater than zero",
            ));
        }
        if self.chunk_overlap >= self.max_chunk_size {
            return Err(ChunkError::invalid_option(format!(
                "chunk_overlap ({}) must be smaller than max_chunk_size ({})",
                self.chunk_overlap, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// A pluggable text splitter.
pub trait Chunker: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Higher priority chunkers are preferred when the default is removed.
    fn priority(&self) -> i32 {
        0
    }

    /// Split `text` into chunks. Implementations must validate `options` first.
    fn chunk(&self, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>>;
}

/// Rough token estimate used for chunk metadata: one token per four characters.
pub fn estimate_tokens(char_count: usize) -> usize {
    char_count.div_ceil(4)
}

/// Maps byte offsets of a string to character offsets.
pub(crate) struct CharIndex {
    byte_starts: Vec<usize>,
    byte_len: usize,
}

impl CharIndex {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            byte_starts: text.char_indices().map(|(b, _)| b).collect(),
            byte_len: text.len(),
        }
    }

    pub(crate) fn char_count(&self) -> usize {
        self.byte_starts.len()
    }

    /// Character offset of a byte offset that lies on a char boundary.
    pub(crate) fn to_char(&self, byte: usize) -> usize {
        if byte >= self.byte_len {
            return self.byte_starts.len();
        }
        match self.byte_starts.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i,
        }
    }

    /// Byte offset of a character offset.
    pub(crate) fn to_byte(&self, ch: usize) -> usize {
        self.byte_starts.get(ch).copied().unwrap_or(self.byte_len)
    }

    pub(crate) fn char_len(&self, bytes: &Range<usize>) -> usize {
        self.to_char(bytes.end) - self.to_char(bytes.start)
    }
}

fn heading_regex() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t#]*$").expect("heading pattern is valid")
    })
}

/// Byte positions and titles of every Markdown heading line in `text`.
pub(crate) struct Sections {
    headings: Vec<(usize, String)>,
}

impl Sections {
    pub(crate) fn scan(text: &str) -> Self {
        let headings = heading_regex()
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let title = caps.get(1)?.as_str().trim().to_string();
                (!title.is_empty()).then_some((whole.start(), title))
            })
            .collect();
        Self { headings }
    }

    /// The last heading starting at or before `bytes.start`, otherwise the first
    /// heading inside the range.
    pub(crate) fn section_for(&self, bytes: &Range<usize>) -> Option<String> {
        let preceding = self
            .headings
            .iter()
            .take_while(|(pos, _)| *pos <= bytes.start)
            .last();
        preceding
            .or_else(|| {
                self.headings
                    .iter()
                    .find(|(pos, _)| *pos > bytes.start && *pos < bytes.end)
            })
            .map(|(_, title)| title.clone())
    }
}

/// Turn byte ranges into numbered [`Chunk`]s, skipping whitespace-only slices.
pub(crate) fn build_chunks(
    text: &str,
    ranges: impl IntoIterator<Item = Range<usize>>,
    index: &CharIndex,
    options: &ChunkOptions,
) -> Vec<Chunk> {
    let sections = options.track_sections.then(|| Sections::scan(text));
    let mut chunks = Vec::new();
    for range in ranges {
        let slice = &text[range.clone()];
        if slice.trim().is_empty() {
            continue;
        }
        let start_offset = index.to_char(range.start);
        let end_offset = index.to_char(range.end);
        chunks.push(Chunk {
            index: chunks.len(),
            text: slice.to_string(),
            start_offset,
            end_offset,
            section: sections.as_ref().and_then(|s| s.section_for(&range)),
            token_count: estimate_tokens(end_offset - start_offset),
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_overlap_at_or_above_size() {
        assert!(ChunkOptions::new(100, 99).validate().is_ok());
        assert!(matches!(
            ChunkOptions::new(100, 100).validate(),
            Err(ChunkError::InvalidOption(_))
        ));
        assert!(matches!(
            ChunkOptions::new(0, 0).validate(),
            Err(ChunkError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_char_index_multibyte() {
        let text = "héllo wörld";
        let index = CharIndex::new(text);
        assert_eq!(index.char_count(), 11);
        let byte = text.find('w').unwrap();
        assert_eq!(index.to_char(byte), 6);
        assert_eq!(index.to_byte(6), byte);
        assert_eq!(index.to_char(text.len()), 11);
    }

    #[test]
    fn test_sections_prefer_preceding_heading() {
        let text = "# Intro\nhello\n## Details\nmore text";
        let sections = Sections::scan(text);
        let details = text.find("more").unwrap();
        assert_eq!(
            sections.section_for(&(details..text.len())).as_deref(),
            Some("Details")
        );
        assert_eq!(sections.section_for(&(0..5)).as_deref(), Some("Intro"));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }
}
