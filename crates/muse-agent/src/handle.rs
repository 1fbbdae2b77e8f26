//! A cloneable handle for observing and cancelling one pipeline run.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio_util::sync::CancellationToken;

/// A cloneable handle for one run.
///
/// All fields are `Arc`-wrapped or shared tokens, so cloning is cheap.
#[derive(Clone)]
pub struct RunHandle {
    cancel: CancellationToken,
    idle_notify: Arc<tokio::sync::Notify>,
    is_running: Arc<AtomicBool>,
}

impl RunHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn started(&self) {
        self.is_running.store(true, Ordering::Release);
    }

    pub(crate) fn finished(&self) {
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    /// Abort the run. Nodes not yet started never run.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get the cancellation token (for callers that need direct access).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the run finishes.
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until the run finishes, with a timeout.
    /// Returns `true` if it finished, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether the run is still executing.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}
