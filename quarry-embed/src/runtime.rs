//! Blocking inference backends.
//!
//! A runtime turns a batch of already-cleaned, already-prefixed strings into
//! vectors. Runtimes are synchronous and may be slow; [`ModelEmbedder`] always
//! calls them from a blocking thread.
//!
//! [`ModelEmbedder`]: crate::ModelEmbedder

use crate::config::{EmbedConfig, ResolvedDevice, RuntimeKind};
use crate::error::{EmbedError, Result};
use fnv::FnvHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// A loaded model.
pub trait EmbeddingRuntime: Send + Sync {
    /// Embed one batch. A refusal to process the batch must be reported as
    /// [`EmbedError::RuntimeFailure`] so callers can retry with less.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;
}

/// Loads a runtime. Called once per embedder initialization.
pub trait RuntimeFactory: Send + Sync {
    fn load(
        &self,
        config: &EmbedConfig,
        device: ResolvedDevice,
    ) -> Result<Arc<dyn EmbeddingRuntime>>;

    /// Whether this factory can place models on a GPU.
    fn gpu_available(&self) -> bool {
        false
    }
}

/// Pick the factory for a configured runtime kind.
pub fn factory_for(kind: RuntimeKind) -> Result<Arc<dyn RuntimeFactory>> {
    match kind {
        RuntimeKind::Hash => Ok(Arc::new(HashRuntimeFactory)),
        #[cfg(feature = "fastembed")]
        RuntimeKind::Fastembed => Ok(Arc::new(crate::fastembed_runtime::FastEmbedFactory)),
        #[cfg(not(feature = "fastembed"))]
        RuntimeKind::Fastembed => Err(EmbedError::invalid_config(
            "fastembed runtime requested but quarry-embed was built without the `fastembed` feature",
        )),
    }
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Deterministic feature-hashing embeddings.
///
/// Each lowercased word and each character trigram is hashed with FNV into a
/// signed bucket; the bucket counts are L2-normalized. Texts that share words
/// land close together, identical texts produce identical vectors. Useful as
/// an offline fallback and in tests.
#[derive(Debug, Clone)]
pub struct HashRuntime {
    dimensions: usize,
}

impl HashRuntime {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, feature: &[u8], seed: u8) -> (usize, f32) {
        let mut hasher = FnvHasher::default();
        hasher.write_u8(seed);
        hasher.write(feature);
        let hash = hasher.finish();
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();

        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let (index, sign) = self.bucket(word.as_bytes(), 0);
            vector[index] += sign * 2.0;

            let chars: Vec<char> = format!(" {word} ").chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                let (index, sign) = self.bucket(trigram.as_bytes(), 1);
                vector[index] += sign;
            }
        }

        // Punctuation and prefixes still distinguish otherwise equal texts.
        let (index, sign) = self.bucket(lower.as_bytes(), 2);
        vector[index] += sign * 0.5;

        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingRuntime for HashRuntime {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

pub struct HashRuntimeFactory;

impl RuntimeFactory for HashRuntimeFactory {
    fn load(
        &self,
        config: &EmbedConfig,
        _device: ResolvedDevice,
    ) -> Result<Arc<dyn EmbeddingRuntime>> {
        Ok(Arc::new(HashRuntime::new(config.resolved_dimensions()?)))
    }
}
