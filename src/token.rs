/// Group-wide stop signal shared by the supervisor, every watcher and the
/// signal bridge.
///
/// Wraps a [`CancellationToken`] with a once-only flag so exactly one caller
/// observes the transition from running to stopping, no matter how many
/// services exit at the same moment.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the whole group stop.
    ///
    /// Returns `true` for the call that actually fired the token and `false`
    /// for every later (or concurrent, losing) call.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            tracing::debug!(reason, "stop already requested");
            return false;
        }
        tracing::info!(reason, "stopping supervision group");
        self.inner.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once the token has been triggered.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
