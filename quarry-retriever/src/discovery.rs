//! Workspace file discovery.
//!
//! Walks the root with the `ignore` crate (gitignore-aware, hidden entries
//! skipped unless configured), classifies each file by type and size and
//! hashes its content with blake3. The `.quarry` state directory is never
//! discovered.

use crate::config::{DiscoveryConfig, STATE_DIR};
use crate::storage::QueuePriority;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use std::io::Read;
use std::path::{Path, PathBuf};

/// How a file's text is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Text,
    Markdown,
    /// No extractable text; content comes from OCR.
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn of(size: u64) -> Self {
        match size {
            s if s < 1 << 20 => Self::Small,
            s if s < 10 << 20 => Self::Medium,
            _ => Self::Large,
        }
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "log", "csv", "tsv", "rst", "adoc", "org", "tex", "rs", "py", "js", "ts", "jsx",
    "tsx", "go", "java", "kt", "c", "cc", "cpp", "h", "hpp", "cs", "rb", "php", "swift", "scala",
    "sh", "bash", "zsh", "sql", "html", "htm", "css", "scss", "xml", "json", "yaml", "yml",
    "toml", "ini", "cfg", "conf",
];

const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown", "mdx"];

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp"];

const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "o", "a", "class", "jar", "zip", "gz", "tar", "7z", "wasm",
    "ico", "mp3", "mp4", "mov", "avi", "woff", "woff2", "ttf", "db", "sqlite", "lock", "pdf",
];

const TEXT_FILE_NAMES: &[&str] = &[
    "README", "CHANGELOG", "LICENSE", "Makefile", "Dockerfile", "AUTHORS", "CONTRIBUTING",
];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Classify by name alone. `None` means skip or unknown; see [`sniff_text`].
pub fn classify(path: &Path) -> Option<FileKind> {
    match extension_of(path).as_deref() {
        Some(ext) if MARKDOWN_EXTENSIONS.contains(&ext) => Some(FileKind::Markdown),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Some(FileKind::Image),
        Some(ext) if TEXT_EXTENSIONS.contains(&ext) => Some(FileKind::Text),
        Some(_) => None,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| TEXT_FILE_NAMES.contains(n))
            .map(|_| FileKind::Text),
    }
}

fn is_known_binary(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.as_str()))
}

/// A file with no NUL byte in its first 8 KiB is treated as text.
fn sniff_text(path: &Path) -> std::io::Result<bool> {
    let mut buf = [0u8; 8192];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut buf)?;
    Ok(!buf[..n].contains(&0))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

fn hash_file_blocking(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    hasher
        .update_reader(file)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Hex blake3 hash of a file's content.
pub async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path)).await?
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Absolute path.
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
    pub kind: FileKind,
    pub extension: Option<String>,
}

impl DiscoveredFile {
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn size_class(&self) -> SizeClass {
        SizeClass::of(self.size)
    }

    /// Queue priority for this file when `requested` was asked for. Images
    /// wait for OCR capacity and large files yield to normal ones.
    pub fn queue_priority(&self, requested: QueuePriority) -> QueuePriority {
        match (self.kind, self.size_class(), requested) {
            (FileKind::Image, _, QueuePriority::Normal | QueuePriority::Low) => {
                QueuePriority::OcrDeferred
            }
            (_, SizeClass::Large, QueuePriority::Normal) => QueuePriority::Low,
            _ => requested,
        }
    }
}

/// Walks and classifies the files under one root.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    root: PathBuf,
    config: DiscoveryConfig,
}

impl FileDiscovery {
    pub fn new(root: impl Into<PathBuf>, config: DiscoveryConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        self.config.extensions.is_empty()
            || extension_of(path).is_some_and(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            })
    }

    pub(crate) fn in_state_dir(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .ok()
            .and_then(|rel| rel.components().next())
            .is_some_and(|first| first.as_os_str() == STATE_DIR)
    }

    /// Kind of `path` if it should be indexed, reading a prefix of files
    /// with unknown extensions.
    pub fn kind_of(&self, path: &Path) -> Option<FileKind> {
        if self.in_state_dir(path) || !self.extension_allowed(path) || is_known_binary(path) {
            return None;
        }
        if !self.config.include_hidden
            && path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return None;
        }
        classify(path).or_else(|| match sniff_text(path) {
            Ok(true) => Some(FileKind::Text),
            _ => None,
        })
    }

    fn walk_blocking(&self) -> Result<Vec<PathBuf>> {
        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.config.exclude {
            overrides
                .add(&format!("!{pattern}"))
                .with_context(|| format!("Invalid exclude pattern '{pattern}'"))?;
        }
        let overrides = overrides.build()?;

        let walker = WalkBuilder::new(&self.root)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(false)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .overrides(overrides)
            .filter_entry(|entry| entry.file_name() != STATE_DIR)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                    files.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable entry"),
            }
        }
        files.sort();
        Ok(files)
    }

    /// Kind and size of an indexable path, without reading its content.
    fn candidate_blocking(&self, path: &Path) -> Result<Option<(FileKind, u64)>> {
        let Some(kind) = self.kind_of(path) else {
            return Ok(None);
        };
        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if size > self.config.max_file_size {
            tracing::debug!(path = %path.display(), size, "Skipping oversized file");
            return Ok(None);
        }
        Ok(Some((kind, size)))
    }

    fn inspect_blocking(&self, path: &Path) -> Result<Option<DiscoveredFile>> {
        let Some((kind, size)) = self.candidate_blocking(path)? else {
            return Ok(None);
        };
        Ok(Some(DiscoveredFile {
            path: path.to_path_buf(),
            size,
            hash: hash_file_blocking(path)?,
            kind,
            extension: extension_of(path),
        }))
    }

    /// Every indexable file under the root, in path order.
    pub async fn discover(&self) -> Result<Vec<DiscoveredFile>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for path in this.walk_blocking()? {
                match this.inspect_blocking(&path) {
                    Ok(Some(file)) => found.push(file),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping file"),
                }
            }
            Ok(found)
        })
        .await?
    }

    /// Every indexable path under the root, in order. Same selection as
    /// [`discover`](Self::discover) but nothing is hashed.
    pub async fn discover_paths(&self) -> Result<Vec<PathBuf>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for path in this.walk_blocking()? {
                match this.candidate_blocking(&path) {
                    Ok(Some(_)) => found.push(path),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping file"),
                }
            }
            Ok(found)
        })
        .await?
    }

    /// Classify and hash a single path, `None` if it is not indexable.
    pub async fn inspect(&self, path: &Path) -> Result<Option<DiscoveredFile>> {
        let this = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || this.inspect_blocking(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_classify() {
        assert_eq!(classify(Path::new("a/notes.MD")), Some(FileKind::Markdown));
        assert_eq!(classify(Path::new("scan.jpeg")), Some(FileKind::Image));
        assert_eq!(classify(Path::new("src/main.rs")), Some(FileKind::Text));
        assert_eq!(classify(Path::new("Makefile")), Some(FileKind::Text));
        assert_eq!(classify(Path::new("blob.xyz")), None);
    }

    #[test]
    fn test_queue_priority_by_class() {
        let file = |kind, size| DiscoveredFile {
            path: PathBuf::from("/x"),
            size,
            hash: String::new(),
            kind,
            extension: None,
        };
        assert_eq!(
            file(FileKind::Image, 10).queue_priority(QueuePriority::Normal),
            QueuePriority::OcrDeferred
        );
        assert_eq!(
            file(FileKind::Text, 20 << 20).queue_priority(QueuePriority::Normal),
            QueuePriority::Low
        );
        assert_eq!(
            file(FileKind::Text, 20 << 20).queue_priority(QueuePriority::High),
            QueuePriority::High
        );
    }

    #[tokio::test]
    async fn test_discover_respects_ignores() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        tokio::fs::write(root.join("readme.md"), "# Hello").await?;
        tokio::fs::write(root.join("notes.unknownext"), "plain words").await?;
        tokio::fs::write(root.join("binary.unknownext"), [0u8, 1, 2, 3]).await?;
        tokio::fs::write(root.join("app.exe"), "MZ").await?;
        tokio::fs::write(root.join(".secret.txt"), "hidden").await?;
        tokio::fs::write(root.join(".gitignore"), "ignored/\n").await?;
        tokio::fs::create_dir_all(root.join("ignored")).await?;
        tokio::fs::write(root.join("ignored/skip.txt"), "skip").await?;
        tokio::fs::create_dir_all(root.join("node_modules/pkg")).await?;
        tokio::fs::write(root.join("node_modules/pkg/index.js"), "x").await?;
        tokio::fs::create_dir_all(root.join(STATE_DIR)).await?;
        tokio::fs::write(root.join(STATE_DIR).join("index.db"), "db").await?;

        let discovery = FileDiscovery::new(root, DiscoveryConfig::default());
        let files = discovery.discover().await?;
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["notes.unknownext", "readme.md"]);
        assert_eq!(files[1].kind, FileKind::Markdown);
        assert_eq!(files[1].hash, hash_bytes(b"# Hello"));
        Ok(())
    }

    #[tokio::test]
    async fn test_size_limit_and_extension_filter() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("big.txt"), "x".repeat(200)).await?;
        tokio::fs::write(dir.path().join("small.txt"), "tiny").await?;
        tokio::fs::write(dir.path().join("code.rs"), "fn main() {}").await?;
        let config = DiscoveryConfig {
            max_file_size: 100,
            extensions: vec!["txt".to_string()],
            ..Default::default()
        };
        let discovery = FileDiscovery::new(dir.path(), config);
        let files = discovery.discover().await?;
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("small.txt"));
        assert!(discovery.inspect(&dir.path().join("code.rs")).await?.is_none());
        Ok(())
    }
}
