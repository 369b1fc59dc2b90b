//! Single-assignment completion signal.
//!
//! The first `resolve` wins; later calls are no-ops that report `false`.
//! Any number of tasks may `wait` and all of them observe the same value.

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Single-writer, multi-reader result box
pub struct CompletionSignal<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> CompletionSignal<T> {
    /// Create an unresolved signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `value` if the signal is still unresolved.
    ///
    /// Returns `true` if this call resolved the signal.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    /// Whether a value has been stored
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The stored value, without waiting
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the signal is resolved
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // The sender lives in `self`, so this only wakes on resolution
            let _ = rx.changed().await;
        }
    }

    /// Wait at most `timeout`; `None` if still unresolved
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl<T: Clone> Default for CompletionSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("resolved", &self.tx.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_resolved());
        assert!(signal.resolve(1));
        assert!(!signal.resolve(2));
        assert_eq!(signal.wait().await, 1);
        assert_eq!(signal.peek(), Some(1));
    }

    #[tokio::test]
    async fn test_many_waiters_see_same_value() {
        let signal = Arc::new(CompletionSignal::<String>::new());
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let signal = Arc::clone(&signal);
            waiters.push(tokio::spawn(async move { signal.wait().await }));
        }

        tokio::task::yield_now().await;
        signal.resolve("done".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), "done");
        }
    }

    #[tokio::test]
    async fn test_wait_after_resolution_returns_immediately() {
        let signal = CompletionSignal::new();
        signal.resolve(7u64);
        assert_eq!(signal.wait_timeout(Duration::from_millis(1)).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_does_not_return_early() {
        let signal = CompletionSignal::<u8>::new();
        assert_eq!(signal.wait_timeout(Duration::from_secs(5)).await, None);
        assert!(!signal.is_resolved());
    }
}
