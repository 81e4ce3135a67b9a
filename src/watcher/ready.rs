//! Count-down readiness barrier.

use std::sync::Arc;
use tokio::sync::watch;

/// Opens once every issued token has arrived.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    remaining: Arc<watch::Sender<usize>>,
}

/// One pending arrival. Consuming it is the only way to arrive, so each
/// track can count at most once.
#[derive(Debug)]
pub struct ReadyToken {
    track: &'static str,
    remaining: Arc<watch::Sender<usize>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            remaining: Arc::new(tx),
        }
    }

    /// Issue a token the gate will wait for.
    pub fn token(&self, track: &'static str) -> ReadyToken {
        self.remaining.send_modify(|n| *n += 1);
        ReadyToken {
            track,
            remaining: self.remaining.clone(),
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Resolve once no token is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyToken {
    pub fn arrive(self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
        tracing::debug!(track = self.track, "Track ready");
    }
}
