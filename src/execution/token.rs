//! Cooperative cancellation token.
//!
//! Passed explicitly into every long-running collaborator invocation so
//! external-tool wrappers can abort cleanly at safe points, instead of the
//! orchestrator guessing at their internal control flow.

use std::sync::Arc;
use tokio::sync::watch;

/// A cheaply-clonable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Non-blocking check, for safe points inside loops.
    pub fn is_canceled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve when the token trips. Used to race external work against
    /// cancellation with `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // Already tripped tokens resolve immediately.
        let _ = receiver.wait_for(|canceled| *canceled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_observed_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_canceled());
        token.cancel();
        assert!(clone.is_canceled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        let observed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(observed);
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("pre-tripped token must resolve immediately");
    }
}
