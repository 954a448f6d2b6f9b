//! Adaptive batch sizing for embedding runtimes.
//!
//! Native runtimes sometimes refuse batches above a limit that depends on the
//! input lengths and available memory. [`BatchSizer`] starts at the configured
//! size and halves it each time the runtime reports a [`RuntimeFailure`]
//! (down to 1), emitting a `batch_size_fallback` warning. The reduced size
//! sticks for later calls until [`BatchSizer::reset`] is called.
//!
//! [`RuntimeFailure`]: crate::EmbedError::RuntimeFailure

use crate::error::Result;
use crate::events::EmbedderEvent;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

#[derive(Debug)]
pub struct BatchSizer {
    configured: usize,
    current: AtomicUsize,
}

impl BatchSizer {
    pub fn new(configured: usize) -> Self {
        let configured = configured.max(1);
        Self {
            configured,
            current: AtomicUsize::new(configured),
        }
    }

    pub fn configured(&self) -> usize {
        self.configured
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Restore the configured batch size.
    pub fn reset(&self) {
        self.current.store(self.configured, Ordering::SeqCst);
    }

    /// Run `embed` over `texts` in batches, shrinking the batch on runtime
    /// failures.
    ///
    /// # Arguments
    /// * `embedder` - Name used in warning events and logs
    /// * `texts` - Inputs, embedded in order
    /// * `events` - Channel that receives `BatchSizeFallback` warnings
    /// * `embed` - Embeds one batch; must return one vector per input
    ///
    /// # Returns
    /// One vector per input, or the runtime error once a single-item batch fails.
    pub async fn run<F, Fut>(
        &self,
        embedder: &str,
        texts: &[String],
        events: &broadcast::Sender<EmbedderEvent>,
        mut embed: F,
    ) -> Result<Vec<Vec<f32>>>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<Vec<f32>>>>,
    {
        let mut vectors = Vec::with_capacity(texts.len());
        let mut position = 0;

        while position < texts.len() {
            let size = self.current().min(texts.len() - position);
            let batch = texts[position..position + size].to_vec();

            match embed(batch).await {
                Ok(batch_vectors) => {
                    vectors.extend(batch_vectors);
                    position += size;
                }
                Err(e) if e.is_runtime_failure() && size > 1 => {
                    let old_size = size;
                    let new_size = (size / 2).max(1);
                    self.current.store(new_size, Ordering::SeqCst);
                    tracing::warn!(
                        embedder,
                        old_size,
                        new_size,
                        error = %e,
                        "Embedding batch failed, reducing batch size"
                    );
                    // No subscribers is fine.
                    let _ = events.send(EmbedderEvent::BatchSizeFallback {
                        embedder: embedder.to_string(),
                        old_size,
                        new_size,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbedError;

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {i}")).collect()
    }

    async fn fails_at_or_above(limit: usize, batch: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if batch.len() >= limit {
            Err(EmbedError::runtime(format!("batch of {} too large", batch.len())))
        } else {
            Ok(batch.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_halves_until_runtime_accepts() {
        let sizer = BatchSizer::new(16);
        let (tx, mut rx) = broadcast::channel(16);

        let out = sizer
            .run("test", &texts(10), &tx, |b| fails_at_or_above(4, b))
            .await
            .unwrap();

        assert_eq!(out.len(), 10);
        assert!(sizer.current() < 4);
        let first = rx.try_recv().unwrap();
        assert!(first.is_warning());
        match first {
            EmbedderEvent::BatchSizeFallback {
                old_size, new_size, ..
            } => {
                assert_eq!(old_size, 10);
                assert_eq!(new_size, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(logs_contain("reducing batch size"));
        assert!(logs_contain("old_size=10 new_size=5"));

        sizer.reset();
        assert_eq!(sizer.current(), 16);
    }

    #[tokio::test]
    async fn test_reduced_size_persists_between_calls() {
        let sizer = BatchSizer::new(8);
        let (tx, mut rx) = broadcast::channel(16);
        sizer
            .run("test", &texts(8), &tx, |b| fails_at_or_above(3, b))
            .await
            .unwrap();
        let learned = sizer.current();
        assert!(learned < 3);
        while rx.try_recv().is_ok() {}

        sizer
            .run("test", &texts(8), &tx, |b| fails_at_or_above(3, b))
            .await
            .unwrap();
        assert_eq!(sizer.current(), learned);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_item_failure_surfaces() {
        let sizer = BatchSizer::new(4);
        let (tx, _rx) = broadcast::channel(16);
        let err = sizer
            .run("test", &texts(3), &tx, |b| fails_at_or_above(1, b))
            .await
            .unwrap_err();
        assert!(err.is_runtime_failure());
        assert_eq!(sizer.current(), 1);
    }

    #[tokio::test]
    async fn test_non_runtime_errors_are_not_retried() {
        let sizer = BatchSizer::new(4);
        let (tx, mut rx) = broadcast::channel(16);
        let err = sizer
            .run("test", &texts(4), &tx, |_| async {
                Err(EmbedError::invalid_config("bad"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
        assert_eq!(sizer.current(), 4);
        assert!(rx.try_recv().is_err());
    }
}
