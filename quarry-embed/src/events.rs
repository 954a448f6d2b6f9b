//! Notifications emitted by embedders.

use serde::{Deserialize, Serialize};

/// Progress and warning notifications from an embedder.
///
/// Delivered over a `tokio::sync::broadcast` channel; dropping the receiver
/// unsubscribes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbedderEvent {
    /// Model loading progress (`stage` is `loading` or `ready`).
    Progress {
        embedder: String,
        stage: String,
        progress: f32,
        message: String,
    },
    /// The runtime failed a batch and the batch size was halved.
    BatchSizeFallback {
        embedder: String,
        old_size: usize,
        new_size: usize,
        reason: String,
    },
}

impl EmbedderEvent {
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::BatchSizeFallback { .. })
    }
}
