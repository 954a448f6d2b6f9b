//! Turns a discovered file into text plus document metadata.
//!
//! Text-like files are read as lossy UTF-8. Form feeds mark page breaks, so
//! chunks of paginated text exports carry page numbers. Images have no text of
//! their own and report one whole-image OCR region instead.

use crate::discovery::FileKind;
use crate::storage::OcrRegion;
use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub title: Option<String>,
    pub mime_type: Option<String>,
    /// Character offsets at which pages 2, 3, ... begin.
    pub page_starts: Vec<usize>,
    pub ocr_regions: Vec<OcrRegion>,
    pub metadata: serde_json::Value,
}

impl ParsedDocument {
    pub fn page_count(&self) -> Option<i64> {
        (!self.page_starts.is_empty()).then(|| self.page_starts.len() as i64 + 1)
    }

    /// 1-based page of a character offset, `None` for unpaginated text.
    pub fn page_at(&self, offset: usize) -> Option<i64> {
        if self.page_starts.is_empty() {
            return None;
        }
        let page = self.page_starts.partition_point(|start| *start <= offset);
        Some(page as i64 + 1)
    }

    pub fn needs_ocr(&self) -> bool {
        !self.ocr_regions.is_empty()
    }
}

pub fn mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// First Markdown heading, ignoring fenced code blocks.
fn markdown_title(text: &str) -> Option<String> {
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let rest = &trimmed[hashes..];
            if rest.starts_with([' ', '\t']) {
                let title = rest.trim().trim_end_matches('#').trim();
                if !title.is_empty() {
                    return Some(title.to_string());
                }
            }
        }
    }
    None
}

fn page_starts(text: &str) -> Vec<usize> {
    text.chars()
        .enumerate()
        .filter(|(_, c)| *c == '\u{000C}')
        .map(|(i, _)| i + 1)
        .collect()
}

pub async fn parse_file(path: &Path, kind: FileKind) -> Result<ParsedDocument> {
    let mime_type = mime_type(path);
    if kind == FileKind::Image {
        return Ok(ParsedDocument {
            mime_type,
            ocr_regions: vec![OcrRegion::whole_image()],
            metadata: serde_json::json!({ "kind": "image" }),
            ..Default::default()
        });
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let title = match kind {
        FileKind::Markdown => markdown_title(&text),
        _ => None,
    };
    let metadata = serde_json::json!({
        "kind": if kind == FileKind::Markdown { "markdown" } else { "text" },
        "line_count": text.lines().count(),
    });
    Ok(ParsedDocument {
        page_starts: page_starts(&text),
        text,
        title,
        mime_type,
        ocr_regions: Vec::new(),
        metadata,
    })
}
