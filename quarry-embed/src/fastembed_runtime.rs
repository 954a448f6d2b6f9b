//! ONNX embedding models through fastembed.

use crate::config::{EmbedConfig, Quantization, ResolvedDevice, model_info};
use crate::error::{EmbedError, Result};
use crate::runtime::{EmbeddingRuntime, RuntimeFactory, l2_normalize};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex, PoisonError};

/// Map a catalog model and precision onto a fastembed model variant.
fn fastembed_model(model: &str, quantization: Quantization) -> Result<EmbeddingModel> {
    let info = model_info(model).ok_or_else(|| EmbedError::not_found(model))?;
    let quantized = quantization.is_quantized();
    let selected = match (info.id, quantized) {
        ("multilingual-e5-small", _) => EmbeddingModel::MultilingualE5Small,
        ("multilingual-e5-base", _) => EmbeddingModel::MultilingualE5Base,
        ("multilingual-e5-large", _) => EmbeddingModel::MultilingualE5Large,
        ("all-MiniLM-L6-v2", true) => EmbeddingModel::AllMiniLML6V2Q,
        ("all-MiniLM-L6-v2", false) => EmbeddingModel::AllMiniLML6V2,
        ("bge-small-en-v1.5", true) => EmbeddingModel::BGESmallENV15Q,
        ("bge-small-en-v1.5", false) => EmbeddingModel::BGESmallENV15,
        (other, _) => return Err(EmbedError::not_found(other)),
    };
    Ok(selected)
}

pub struct FastEmbedFactory;

impl RuntimeFactory for FastEmbedFactory {
    fn load(
        &self,
        config: &EmbedConfig,
        device: ResolvedDevice,
    ) -> Result<Arc<dyn EmbeddingRuntime>> {
        let dimensions = config.resolved_dimensions()?;
        let model = fastembed_model(&config.model, device.quantization)?;
        tracing::info!(
            model = %config.model,
            quantization = %device.quantization,
            device = ?device.device,
            "Loading fastembed model"
        );

        let mut options =
            InitOptions::new(model).with_show_download_progress(config.show_download_progress);
        if let Some(cache_dir) = &config.cache_dir {
            options = options.with_cache_dir(cache_dir.clone());
        }

        let embedding =
            TextEmbedding::try_new(options).map_err(|e| EmbedError::External { source: e })?;
        Ok(Arc::new(FastEmbedRuntime {
            model: Mutex::new(embedding),
            dimensions,
        }))
    }
}

pub struct FastEmbedRuntime {
    model: Mutex<TextEmbedding>,
    dimensions: usize,
}

impl EmbeddingRuntime for FastEmbedRuntime {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let mut vectors = model
            .embed(texts.to_vec(), Some(texts.len().max(1)))
            .map_err(|e| EmbedError::runtime(e.to_string()))?;
        for vector in vectors.iter_mut() {
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_mapping() {
        assert!(matches!(
            fastembed_model("Xenova/multilingual-e5-small", Quantization::Q8),
            Ok(EmbeddingModel::MultilingualE5Small)
        ));
        assert!(matches!(
            fastembed_model("all-MiniLM-L6-v2", Quantization::Int8),
            Ok(EmbeddingModel::AllMiniLML6V2Q)
        ));
        assert!(fastembed_model("nope", Quantization::Fp32).is_err());
    }
}
