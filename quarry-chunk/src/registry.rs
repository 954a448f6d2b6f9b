use crate::chunk::{Chunk, ChunkOptions, Chunker};
use crate::error::{ChunkError, Result};
use crate::fixed::FixedSizeChunker;
use crate::text::RecursiveChunker;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    chunkers: Vec<Arc<dyn Chunker>>,
    default: Option<String>,
}

/// Named collection of chunkers with a default.
///
/// The registry is an ordinary value owned by whoever needs it (normally the
/// engine handle) and shared by reference; [`ChunkerRegistry::reset`] clears it.
#[derive(Default)]
pub struct ChunkerRegistry {
    inner: RwLock<Inner>,
}

impl ChunkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the recursive chunker (default) and the
    /// fixed-size fallback.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(RecursiveChunker::default()));
        registry.register(Arc::new(FixedSizeChunker));
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a chunker, replacing any chunker with the same name. The first
    /// chunker registered becomes the default.
    pub fn register(&self, chunker: Arc<dyn Chunker>) {
        let mut inner = self.write();
        let name = chunker.name().to_string();
        inner.chunkers.retain(|c| c.name() != name);
        inner.chunkers.push(chunker);
        if inner.default.is_none() {
            inner.default = Some(name);
        }
    }

    /// Removes a chunker. Removing the default promotes the highest-priority
    /// remaining chunker.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        let before = inner.chunkers.len();
        inner.chunkers.retain(|c| c.name() != name);
        if inner.chunkers.len() == before {
            return Err(ChunkError::not_found(name));
        }
        if inner.default.as_deref() == Some(name) {
            inner.default = inner
                .chunkers
                .iter()
                .max_by_key(|c| c.priority())
                .map(|c| c.name().to_string());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Chunker>> {
        self.read()
            .chunkers
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| ChunkError::not_found(name))
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.chunkers.iter().any(|c| c.name() == name) {
            return Err(ChunkError::not_found(name));
        }
        inner.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.read().default.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().chunkers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Chunk with the default chunker.
    pub fn chunk(&self, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>> {
        let name = self
            .default_name()
            .ok_or_else(|| ChunkError::not_found("<default>"))?;
        self.chunk_with(&name, text, options)
    }

    /// Chunk with a named chunker.
    pub fn chunk_with(&self, name: &str, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>> {
        let chunker = self.get(name)?;
        chunker.chunk(text, options)
    }

    /// Drops every chunker and the default.
    pub fn reset(&self) {
        *self.write() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Chunker for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn priority(&self) -> i32 {
            50
        }

        fn chunk(&self, text: &str, options: &ChunkOptions) -> Result<Vec<Chunk>> {
            options.validate()?;
            Ok(vec![Chunk {
                index: 0,
                text: text.to_uppercase(),
                start_offset: 0,
                end_offset: text.chars().count(),
                section: None,
                token_count: 1,
            }])
        }
    }

    #[test]
    fn test_first_registered_is_default() {
        let registry = ChunkerRegistry::with_defaults();
        assert_eq!(registry.default_name().as_deref(), Some("recursive"));
        registry.register(Arc::new(Upper));
        assert_eq!(registry.default_name().as_deref(), Some("recursive"));
        let chunks = registry.chunk("hello", &ChunkOptions::default()).unwrap();
        assert_eq!(chunks[0].text, "hello");
    }

    #[test]
    fn test_set_default_and_chunk_with() {
        let registry = ChunkerRegistry::with_defaults();
        registry.register(Arc::new(Upper));
        registry.set_default("upper").unwrap();
        let chunks = registry.chunk("hello", &ChunkOptions::default()).unwrap();
        assert_eq!(chunks[0].text, "HELLO");
        let chunks = registry.chunk_with("fixed", "hello", &ChunkOptions::default()).unwrap();
        assert_eq!(chunks[0].text, "hello");
    }

    #[test]
    fn test_unknown_names_are_not_found() {
        let registry = ChunkerRegistry::with_defaults();
        assert!(matches!(registry.set_default("nope"), Err(ChunkError::NotFound(_))));
        assert!(matches!(
            registry.chunk_with("nope", "x", &ChunkOptions::default()),
            Err(ChunkError::NotFound(_))
        ));
        assert!(matches!(registry.unregister("nope"), Err(ChunkError::NotFound(_))));
    }

    #[test]
    fn test_unregister_default_promotes_highest_priority() {
        let registry = ChunkerRegistry::with_defaults();
        registry.register(Arc::new(Upper));
        registry.unregister("recursive").unwrap();
        assert_eq!(registry.default_name().as_deref(), Some("upper"));
    }

    #[test]
    fn test_reset_empties_registry() {
        let registry = ChunkerRegistry::with_defaults();
        registry.reset();
        assert!(registry.names().is_empty());
        assert!(matches!(
            registry.chunk("x", &ChunkOptions::default()),
            Err(ChunkError::NotFound(_))
        ));
    }
}
