//! OCR through the `tesseract` command-line tool.
//!
//! Recognition runs `tesseract <image> stdout -l <langs> tsv` and rebuilds the
//! text from the word rows, so regions with a bounding box keep only the words
//! inside it and the reported confidence is the mean word confidence.

use super::{OcrCapability, OcrOutput, OcrProvider};
use crate::error::QuarryError;
use crate::storage::OcrRegion;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;

pub struct TesseractProvider {
    command: String,
    languages: Vec<String>,
    ready: AtomicBool,
}

impl TesseractProvider {
    pub fn new(command: impl Into<String>, languages: Vec<String>) -> Self {
        Self {
            command: command.into(),
            languages,
            ready: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Word {
    line: (u32, u32, u32, u32),
    bbox: [u32; 4],
    confidence: f32,
    text: String,
}

fn parse_tsv(tsv: &str) -> Vec<Word> {
    let mut words = Vec::new();
    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<u32>().unwrap_or(0);
        let confidence = cols[10].trim().parse::<f32>().unwrap_or(-1.0);
        let text = cols[11].trim();
        if confidence < 0.0 || text.is_empty() {
            continue;
        }
        words.push(Word {
            line: (num(1), num(2), num(3), num(4)),
            bbox: [num(6), num(7), num(8), num(9)],
            confidence,
            text: text.to_string(),
        });
    }
    words
}

fn intersects(a: [u32; 4], b: [u32; 4]) -> bool {
    let [ax, ay, aw, ah] = a;
    let [bx, by, bw, bh] = b;
    ax < bx + bw && bx < ax + aw && ay < by + bh && by < ay + ah
}

fn assemble(words: &[Word], bbox: Option<[u32; 4]>) -> (String, f32) {
    let kept: Vec<&Word> = words
        .iter()
        .filter(|w| bbox.is_none_or(|b| intersects(w.bbox, b)))
        .collect();
    if kept.is_empty() {
        return (String::new(), 0.0);
    }
    let mut text = String::new();
    let mut current = None;
    for word in &kept {
        match current {
            Some(line) if line == word.line => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        text.push_str(&word.text);
        current = Some(word.line);
    }
    let confidence = kept.iter().map(|w| w.confidence).sum::<f32>() / kept.len() as f32;
    (text, confidence)
}

#[async_trait]
impl OcrProvider for TesseractProvider {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn languages(&self) -> Vec<String> {
        self.languages.clone()
    }

    async fn detect(&self) -> OcrCapability {
        match Command::new(&self.command).arg("--version").output().await {
            Ok(output) if output.status.success() => {
                // Older releases print the version on stderr.
                let text = if output.stdout.is_empty() {
                    output.stderr
                } else {
                    output.stdout
                };
                let version = String::from_utf8_lossy(&text)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                OcrCapability::Available { version }
            }
            Ok(output) => OcrCapability::Unavailable {
                reason: format!("{} --version exited with {}", self.command, output.status),
            },
            Err(e) => OcrCapability::Unavailable {
                reason: format!("{} not runnable: {e}", self.command),
            },
        }
    }

    async fn initialize(&self) -> Result<()> {
        if let OcrCapability::Unavailable { reason } = self.detect().await {
            return Err(QuarryError::not_found(reason).into());
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn recognize(
        &self,
        image: &Path,
        region: &OcrRegion,
        languages: &[String],
    ) -> Result<OcrOutput> {
        let source = region.image_path.as_deref().map(Path::new).unwrap_or(image);
        let langs = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };
        let output = Command::new(&self.command)
            .arg(source)
            .arg("stdout")
            .args(["-l", &langs, "tsv"])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.command))?;
        if !output.status.success() {
            return Err(QuarryError::RuntimeFailure(format!(
                "tesseract failed on {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        let words = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        let (text, confidence) = assemble(&words, region.bbox);
        Ok(OcrOutput {
            text,
            confidence,
            page: region.page,
        })
    }
}
