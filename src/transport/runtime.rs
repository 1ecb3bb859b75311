#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Sleeps for a duration but aborts early if the shutdown token fires.
/// Returns `true` if shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Start/stop bookkeeping shared by the receivers: each run gets a child of
/// the kernel token that `stop` can cancel on its own.
#[derive(Debug, Default)]
pub struct ReceiverControl {
    active: Mutex<Option<CancellationToken>>,
    stopped: AtomicBool,
}

impl ReceiverControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one receive loop. Already cancelled if the receiver was stopped.
    pub fn begin(&self, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        if self.stopped.load(Ordering::SeqCst) {
            token.cancel();
        }
        *self.active.lock().expect("receiver control poisoned") = Some(token.clone());
        token
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = self.active.lock().expect("receiver control poisoned").take() {
            token.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_cancels_the_running_loop_only() {
        let shutdown = CancellationToken::new();
        let control = ReceiverControl::new();
        let token = control.begin(&shutdown);
        control.stop();
        control.stop();
        assert!(token.is_cancelled());
        assert!(!shutdown.is_cancelled());
        assert!(control.begin(&shutdown).is_cancelled());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(sleep_with_shutdown(Duration::from_secs(60), &shutdown).await);
    }
}
