//! Configuration for embedders

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which inference backend produces vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// ONNX models through fastembed.
    #[default]
    Fastembed,
    /// Deterministic feature hashing; no model download.
    Hash,
}

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Requested weight precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    Fp32,
    Fp16,
    #[default]
    Q8,
    Int8,
    Q4,
}

impl Quantization {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Q8 | Self::Int8 | Self::Q4)
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Q8 => "q8",
            Self::Int8 => "int8",
            Self::Q4 => "q4",
        };
        f.write_str(s)
    }
}

impl FromStr for Quantization {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" => Ok(Self::Fp32),
            "fp16" | "f16" => Ok(Self::Fp16),
            "q8" => Ok(Self::Q8),
            "int8" | "i8" => Ok(Self::Int8),
            "q4" => Ok(Self::Q4),
            other => Err(EmbedError::invalid_config(format!(
                "unknown quantization '{other}'"
            ))),
        }
    }
}

/// Device and precision after availability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDevice {
    pub device: Device,
    pub quantization: Quantization,
}

/// Device/precision request passed to a runtime at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub device: Device,
    pub quantization: Quantization,
}

impl DeviceConfig {
    /// Resolve `Auto` and unsupported requests to something the runtime can run.
    ///
    /// GPU execution needs an accelerated runtime build; without one the
    /// request falls back to CPU. Half precision on CPU runs as fp32.
    pub fn resolve(&self, gpu_available: bool) -> ResolvedDevice {
        let device = match self.device {
            Device::Auto if gpu_available => Device::Gpu,
            Device::Auto => Device::Cpu,
            Device::Gpu if !gpu_available => {
                tracing::warn!("GPU requested for embeddings but unavailable, using CPU");
                Device::Cpu
            }
            other => other,
        };
        let quantization = match (device, self.quantization) {
            (Device::Cpu, Quantization::Fp16) => Quantization::Fp32,
            (_, q) => q,
        };
        ResolvedDevice {
            device,
            quantization,
        }
    }
}

/// Static facts about a known embedding model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub dimensions: usize,
    pub max_tokens: usize,
    pub multilingual: bool,
}

impl ModelInfo {
    /// E5-family models expect `query: ` / `passage: ` prefixes.
    pub fn uses_e5_prefixes(model_id: &str) -> bool {
        model_id.to_ascii_lowercase().contains("e5")
    }
}

/// Models the engine knows how to size without loading them.
pub const MODEL_CATALOG: &[ModelInfo] = &[
    ModelInfo {
        id: "multilingual-e5-small",
        dimensions: 384,
        max_tokens: 512,
        multilingual: true,
    },
    ModelInfo {
        id: "multilingual-e5-base",
        dimensions: 768,
        max_tokens: 512,
        multilingual: true,
    },
    ModelInfo {
        id: "multilingual-e5-large",
        dimensions: 1024,
        max_tokens: 512,
        multilingual: true,
    },
    ModelInfo {
        id: "all-MiniLM-L6-v2",
        dimensions: 384,
        max_tokens: 256,
        multilingual: false,
    },
    ModelInfo {
        id: "bge-small-en-v1.5",
        dimensions: 384,
        max_tokens: 512,
        multilingual: false,
    },
];

/// Look up a model by id, ignoring case and an optional `org/` prefix.
pub fn model_info(model_id: &str) -> Option<&'static ModelInfo> {
    let bare = model_id.rsplit('/').next().unwrap_or(model_id);
    MODEL_CATALOG
        .iter()
        .find(|m| m.id.eq_ignore_ascii_case(bare))
}

pub const DEFAULT_MODEL: &str = "multilingual-e5-small";

/// Configuration for one embedder instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Backend used to compute vectors.
    pub runtime: RuntimeKind,
    /// Model identifier, e.g. `multilingual-e5-small`.
    pub model: String,
    /// Vector size; required for models outside the catalog.
    pub dimensions: Option<usize>,
    /// Configured batch size; the adaptive fallback may lower it at runtime.
    pub batch_size: usize,
    /// Where downloaded model files are cached.
    pub cache_dir: Option<PathBuf>,
    pub show_download_progress: bool,
    /// Selection priority within a registry.
    pub priority: i32,
    pub device: DeviceConfig,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            model: DEFAULT_MODEL.to_string(),
            dimensions: None,
            batch_size: 16,
            cache_dir: None,
            show_download_progress: false,
            priority: 0,
            device: DeviceConfig::default(),
        }
    }
}

impl EmbedConfig {
    /// Configuration for the deterministic hashing runtime.
    pub fn hashed(dimensions: usize) -> Self {
        Self {
            runtime: RuntimeKind::Hash,
            model: "hash-e5".to_string(),
            dimensions: Some(dimensions),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Vector size from the explicit setting or the model catalog.
    pub fn resolved_dimensions(&self) -> Result<usize> {
        match (self.dimensions, model_info(&self.model)) {
            (Some(0), _) => Err(EmbedError::invalid_config("dimensions must be positive")),
            (Some(d), Some(info)) if d != info.dimensions => Err(EmbedError::invalid_config(
                format!(
                    "model {} produces {} dimensions, configured {}",
                    info.id, info.dimensions, d
                ),
            )),
            (Some(d), _) => Ok(d),
            (None, Some(info)) => Ok(info.dimensions),
            (None, None) => Err(EmbedError::invalid_config(format!(
                "unknown model '{}' needs explicit dimensions",
                self.model
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        self.resolved_dimensions().map(|_| ())
    }
}
