//! Shutdown coordination for the sidecar.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long tasks get to wind down after the signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinator for graceful shutdown.
///
/// Hands out child tokens that long-running tasks select on.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown is triggered.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Wait for `tasks` to finish, giving up after `timeout`.
    pub async fn drain(tasks: Vec<JoinHandle<()>>, timeout: Duration) {
        let all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Shutdown drain timed out");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_subscribers() {
        let shutdown = Shutdown::new();
        let token = shutdown.subscribe();
        assert!(!token.is_cancelled());

        shutdown.trigger();
        token.cancelled().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = std::time::Instant::now();
        Shutdown::drain(vec![stuck], Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
