//! Request/response correlation shared by the embedding worker and the
//! supervisor's child-process channel.
//!
//! Every outbound request gets a fresh string id and a oneshot receiver. The
//! transport's reader completes the matching entry when the reply arrives.
//! Callers wait with a timeout; a timed-out entry is removed so a late reply
//! is ignored.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Why a correlated call produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("channel closed before a reply arrived")]
    Closed,
}

/// Table of in-flight requests keyed by correlation id.
pub struct PendingCalls<T> {
    inner: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingCalls<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new random correlation id.
    pub fn next_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new call and return its id and reply receiver.
    pub fn register(&self) -> (String, oneshot::Receiver<T>) {
        let id = Self::next_id();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a reply. Returns false when nobody is waiting for `id`.
    pub fn complete(&self, id: &str, value: T) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Forget a call; its receiver sees [`CallError::Closed`].
    pub fn cancel(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Drop every pending call, failing all waiters with [`CallError::Closed`].
    pub fn fail_all(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.len();
        inner.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the reply to `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, CallError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                self.cancel(id);
                Err(CallError::TimedOut(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let pending = Arc::new(PendingCalls::<u32>::new());
        let (id, rx) = pending.register();
        let responder = Arc::clone(&pending);
        let reply_id = id.clone();
        tokio::spawn(async move {
            assert!(responder.complete(&reply_id, 7));
        });
        let value = pending.wait(&id, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 7);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let pending = PendingCalls::<u32>::new();
        let (id, rx) = pending.register();
        let err = pending
            .wait(&id, rx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::TimedOut(Duration::from_millis(10)));
        assert!(!pending.complete(&id, 1));
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let pending = PendingCalls::<u32>::new();
        let (id, rx) = pending.register();
        let (_other, _rx2) = pending.register();
        assert_eq!(pending.fail_all(), 2);
        let err = pending.wait(&id, rx, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, CallError::Closed);
    }

    #[test]
    fn test_ids_are_unique() {
        let pending = PendingCalls::<()>::new();
        let (a, _ra) = pending.register();
        let (b, _rb) = pending.register();
        assert_ne!(a, b);
    }
}
