//! Optical character recognition.
//!
//! Providers are optional at runtime: each one reports an [`OcrCapability`]
//! from [`OcrProvider::detect`] and the registry only hands out providers that
//! are available and support the requested language. [`queue::OcrQueueManager`]
//! runs recognition jobs recorded in the store.

pub mod queue;
pub mod tesseract;

pub use queue::{OcrQueueManager, OcrQueueState};
pub use tesseract::TesseractProvider;

use crate::error::QuarryError;
use crate::storage::OcrRegion;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Result of probing for a provider's runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OcrCapability {
    Available { version: String },
    Unavailable { reason: String },
}

impl OcrCapability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

/// Text recognised in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    /// Mean word confidence, 0-100.
    pub confidence: f32,
    pub page: Option<u32>,
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Supported language codes.
    fn languages(&self) -> Vec<String>;

    fn priority(&self) -> i32 {
        0
    }

    async fn detect(&self) -> OcrCapability;

    async fn initialize(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    /// Recognise `region` of the image at `image`.
    async fn recognize(
        &self,
        image: &Path,
        region: &OcrRegion,
        languages: &[String],
    ) -> Result<OcrOutput>;
}

/// Named OCR providers, chosen by language and priority.
#[derive(Default)]
pub struct OcrProviderRegistry {
    providers: RwLock<Vec<Arc<dyn OcrProvider>>>,
}

impl OcrProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider, replacing one with the same name.
    pub fn register(&self, provider: Arc<dyn OcrProvider>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        providers.retain(|p| p.name() != provider.name());
        providers.push(provider);
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let before = providers.len();
        providers.retain(|p| p.name() != name);
        if providers.len() == before {
            return Err(QuarryError::not_found(format!("OCR provider {name}")).into());
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn reset(&self) {
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Highest-priority available provider that supports every language in
    /// `languages`, initialized before it is returned.
    pub async fn select(&self, languages: &[String]) -> Result<Arc<dyn OcrProvider>> {
        let mut candidates: Vec<Arc<dyn OcrProvider>> = {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            providers
                .iter()
                .filter(|p| {
                    let supported = p.languages();
                    languages.iter().all(|lang| supported.contains(lang))
                })
                .cloned()
                .collect()
        };
        candidates.sort_by_key(|p| std::cmp::Reverse(p.priority()));

        for provider in candidates {
            match provider.detect().await {
                OcrCapability::Available { .. } => {
                    if !provider.is_ready() {
                        provider.initialize().await?;
                    }
                    return Ok(provider);
                }
                OcrCapability::Unavailable { reason } => {
                    tracing::debug!(provider = provider.name(), %reason, "OCR provider unavailable");
                }
            }
        }
        Err(QuarryError::not_found(format!(
            "no available OCR provider for languages {}",
            languages.join("+")
        ))
        .into())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted provider: fails the first `failures` calls, then returns
    /// `text` at `confidence`.
    pub struct ScriptedProvider {
        pub name: String,
        pub available: bool,
        pub priority: i32,
        pub text: String,
        pub confidence: f32,
        pub failures: AtomicUsize,
        pub calls: AtomicUsize,
        pub ready: AtomicBool,
        pub seen: Mutex<Vec<OcrRegion>>,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, text: &str) -> Self {
            Self {
                name: name.to_string(),
                available: true,
                priority: 0,
                text: text.to_string(),
                confidence: 90.0,
                failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                ready: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OcrProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn languages(&self) -> Vec<String> {
            vec!["eng".to_string()]
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn detect(&self) -> OcrCapability {
            if self.available {
                OcrCapability::Available {
                    version: "test".into(),
                }
            } else {
                OcrCapability::Unavailable {
                    reason: "not installed".into(),
                }
            }
        }

        async fn initialize(&self) -> Result<()> {
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn recognize(
            &self,
            _image: &Path,
            region: &OcrRegion,
            _languages: &[String],
        ) -> Result<OcrOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(region.clone());
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QuarryError::RuntimeFailure("engine crashed".into()).into());
            }
            Ok(OcrOutput {
                text: self.text.clone(),
                confidence: self.confidence,
                page: region.page,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    #[tokio::test]
    async fn test_select_prefers_available_high_priority() -> Result<()> {
        let registry = OcrProviderRegistry::new();
        let mut missing = ScriptedProvider::new("missing", "");
        missing.available = false;
        missing.priority = 10;
        let mut low = ScriptedProvider::new("low", "");
        low.priority = 1;
        let mut high = ScriptedProvider::new("high", "");
        high.priority = 5;
        registry.register(Arc::new(missing));
        registry.register(Arc::new(low));
        registry.register(Arc::new(high));

        let chosen = registry.select(&["eng".to_string()]).await?;
        assert_eq!(chosen.name(), "high");
        assert!(chosen.is_ready());

        let err = registry.select(&["jpn".to_string()]).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<QuarryError>(),
            Some(QuarryError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unregister_and_reset() {
        let registry = OcrProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("a", "")));
        registry.register(Arc::new(ScriptedProvider::new("a", "")));
        assert_eq!(registry.names(), vec!["a"]);
        assert!(registry.unregister("b").is_err());
        registry.reset();
        assert!(registry.names().is_empty());
    }
}
