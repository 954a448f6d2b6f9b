//! Named collection of embedders with automatic default selection.

use crate::error::{EmbedError, Result};
use crate::provider::Embedder;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    embedders: Vec<Arc<dyn Embedder>>,
    default: Option<String>,
    /// Set by `set_default`; suppresses automatic re-selection.
    pinned: bool,
}

impl Inner {
    /// Highest-priority ready embedder, else highest-priority overall.
    fn best(&self) -> Option<String> {
        let ready = self
            .embedders
            .iter()
            .filter(|e| e.is_ready())
            .max_by_key(|e| e.priority());
        ready
            .or_else(|| self.embedders.iter().max_by_key(|e| e.priority()))
            .map(|e| e.name().to_string())
    }

    fn refresh_default(&mut self) {
        if !self.pinned {
            self.default = self.best();
        }
    }
}

/// Registry of embedders owned by the engine handle.
#[derive(Default)]
pub struct EmbedderRegistry {
    inner: RwLock<Inner>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an embedder, replacing one with the same name, and re-evaluate the
    /// default.
    pub fn register(&self, embedder: Arc<dyn Embedder>) {
        let mut inner = self.write();
        let name = embedder.name().to_string();
        inner.embedders.retain(|e| e.name() != name);
        inner.embedders.push(embedder);
        inner.refresh_default();
        tracing::debug!(embedder = %name, default = ?inner.default, "Registered embedder");
    }

    /// Remove an embedder. Removing the default promotes the next best one.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Embedder>> {
        let mut inner = self.write();
        let position = inner
            .embedders
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| EmbedError::not_found(name))?;
        let removed = inner.embedders.remove(position);
        if inner.default.as_deref() == Some(name) {
            inner.pinned = false;
        }
        inner.refresh_default();
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Embedder>> {
        self.read()
            .embedders
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| EmbedError::not_found(name))
    }

    /// The current default embedder.
    pub fn get_default(&self) -> Result<Arc<dyn Embedder>> {
        let name = self
            .default_name()
            .ok_or_else(|| EmbedError::not_found("<default>"))?;
        self.get(&name)
    }

    pub fn default_name(&self) -> Option<String> {
        let mut inner = self.write();
        // Readiness may have changed since the last registration.
        inner.refresh_default();
        inner.default.clone()
    }

    /// Pin the default to `name`.
    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.embedders.iter().any(|e| e.name() == name) {
            return Err(EmbedError::not_found(name));
        }
        inner.default = Some(name.to_string());
        inner.pinned = true;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.read()
            .embedders
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().embedders.is_empty()
    }

    /// Initialize the default embedder and return it.
    pub async fn initialize_default(&self) -> Result<Arc<dyn Embedder>> {
        let embedder = self.get_default()?;
        embedder.initialize().await?;
        Ok(embedder)
    }

    /// Dispose every embedder and empty the registry.
    pub async fn reset(&self) -> Result<()> {
        let embedders = std::mem::take(&mut *self.write()).embedders;
        for embedder in embedders {
            if let Err(e) = embedder.dispose().await {
                tracing::warn!(embedder = embedder.name(), error = %e, "Failed to dispose embedder");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedConfig;
    use crate::provider::ModelEmbedder;

    fn embedder(name: &str, priority: i32) -> Arc<dyn Embedder> {
        Arc::new(
            ModelEmbedder::new(name, EmbedConfig::hashed(8).with_priority(priority)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_prefers_ready_then_priority() -> anyhow::Result<()> {
        let registry = EmbedderRegistry::new();
        let low = embedder("low", 1);
        let high = embedder("high", 10);
        registry.register(Arc::clone(&low));
        registry.register(Arc::clone(&high));
        assert_eq!(registry.default_name().as_deref(), Some("high"));

        low.initialize().await?;
        assert_eq!(registry.default_name().as_deref(), Some("low"));

        high.initialize().await?;
        assert_eq!(registry.default_name().as_deref(), Some("high"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unregister_default_promotes_next() -> anyhow::Result<()> {
        let registry = EmbedderRegistry::new();
        registry.register(embedder("a", 1));
        registry.register(embedder("b", 5));
        registry.register(embedder("c", 3));
        assert_eq!(registry.default_name().as_deref(), Some("b"));
        registry.unregister("b")?;
        assert_eq!(registry.default_name().as_deref(), Some("c"));
        assert!(matches!(registry.unregister("b"), Err(EmbedError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_pinned_default_and_reset() -> anyhow::Result<()> {
        let registry = EmbedderRegistry::new();
        registry.register(embedder("a", 1));
        registry.register(embedder("b", 5));
        registry.set_default("a")?;
        assert_eq!(registry.default_name().as_deref(), Some("a"));
        assert!(registry.set_default("zzz").is_err());

        let ready = registry.initialize_default().await?;
        assert_eq!(ready.name(), "a");
        assert!(ready.is_ready());

        registry.reset().await?;
        assert!(registry.is_empty());
        assert!(!ready.is_ready());
        assert!(matches!(registry.get_default(), Err(EmbedError::NotFound { .. })));
        Ok(())
    }
}
