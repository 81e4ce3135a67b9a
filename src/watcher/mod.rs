//! Mesh state watcher.
//!
//! # Data Flow
//! ```text
//! startup: proxy id lookup + service lookup (fatal on failure)
//!
//! tracks.rs (one task each)          state.rs
//!     CA roots        ─┐
//!     leaf cert        ├─ write under lock ─→ WatcherState
//!     proxy definition ┤                           │
//!     service identity ┘                           │
//!     per-upstream health (spawned by proxy track) │
//!            │                                     │
//!            └─ change signal (capacity 1) ─→ consumer ─→ Snapshot ─→ output
//! ```
//!
//! # Design Decisions
//! - Nothing is emitted until every track has succeeded once (ready.rs)
//! - Bursts of changes collapse into one signal; the consumer always reads
//!   the latest state, so dropping duplicates loses nothing
//! - The output send blocks, which is how the reconciler applies backpressure

pub mod ready;
pub mod state;
mod tracks;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::mesh::types::DEFAULT_WAIT_TIME;
use crate::mesh::{ControlPlane, MeshError, QueryOptions};
use crate::observability::metrics;
use crate::snapshot::Snapshot;

pub use ready::{ReadinessGate, ReadyToken};
pub use state::WatcherState;
pub use tracks::{DEFAULT_BIND_ADDRESS, DEFAULT_TARGET_ADDRESS};

/// Pause between a failed query and its retry.
pub const ERROR_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to resolve sidecar proxy for '{service_id}': {source}")]
    ProxyLookup {
        service_id: String,
        #[source]
        source: MeshError,
    },

    #[error("failed to look up service '{service_id}': {source}")]
    ServiceLookup {
        service_id: String,
        #[source]
        source: MeshError,
    },

    #[error("snapshot receiver closed")]
    OutputClosed,
}

/// Timing knobs; the defaults are what production uses.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub error_delay: Duration,
    /// Upper bound for each blocking query.
    pub wait_time: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            error_delay: ERROR_DELAY,
            wait_time: DEFAULT_WAIT_TIME,
        }
    }
}

/// State shared between the tracks and the consumer.
pub(crate) struct Shared<C> {
    control: C,
    service_id: String,
    service_name: String,
    proxy_id: String,
    options: WatcherOptions,
    state: Mutex<WatcherState>,
    updates: mpsc::Sender<()>,
    /// Cancelled when the watcher stops; upstream tokens are its children.
    shutdown: CancellationToken,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Post a change signal. False when a signal already pending covers
    /// this one, or the consumer is gone.
    fn notify_changed(&self) -> bool {
        match self.updates.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Closed(())) => {
                tracing::debug!("Change signal dropped, consumer gone");
                false
            }
        }
    }
}

/// Turn each drained change signal into exactly one snapshot, built from
/// the state as it is when the signal is taken.
async fn publish<C>(
    shared: &Shared<C>,
    mut updates: mpsc::Receiver<()>,
    output: &mpsc::Sender<Snapshot>,
) -> Result<(), WatcherError> {
    let stop = &shared.shutdown;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            signal = updates.recv() => {
                if signal.is_none() {
                    return Ok(());
                }
            }
        }

        let snapshot = shared.lock().snapshot(&shared.service_name, &shared.service_id);
        let Some(snapshot) = snapshot else {
            tracing::debug!("No leaf certificate yet, holding snapshot");
            continue;
        };
        metrics::record_snapshot();

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            sent = output.send(snapshot) => {
                if sent.is_err() {
                    return Err(WatcherError::OutputClosed);
                }
            }
        }
    }
}

/// Streams snapshots of the mesh state for one service.
pub struct Watcher<C> {
    service_id: String,
    control: C,
    output: mpsc::Sender<Snapshot>,
    shutdown: CancellationToken,
    options: WatcherOptions,
}

impl<C: ControlPlane> Watcher<C> {
    pub fn new(
        service_id: impl Into<String>,
        control: C,
        output: mpsc::Sender<Snapshot>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            control,
            output,
            shutdown,
            options: WatcherOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Watch until shutdown. Fails only if the initial lookups fail or the
    /// snapshot receiver goes away.
    pub async fn run(self) -> Result<(), WatcherError> {
        let proxy_id = self
            .control
            .sidecar_proxy_id(&self.service_id)
            .await
            .map_err(|source| WatcherError::ProxyLookup {
                service_id: self.service_id.clone(),
                source,
            })?;

        let (service, _) = self
            .control
            .agent_service(&self.service_id, &QueryOptions::default())
            .await
            .map_err(|source| WatcherError::ServiceLookup {
                service_id: self.service_id.clone(),
                source,
            })?;

        tracing::info!(
            service = %service.service,
            service_id = %self.service_id,
            proxy_id = %proxy_id,
            "Resolved mesh identity"
        );

        // Tracks stop with the watcher, whichever way it exits.
        let stop = self.shutdown.child_token();
        let _stop_guard = stop.clone().drop_guard();

        let (updates_tx, updates) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            control: self.control,
            service_id: self.service_id,
            service_name: service.service,
            proxy_id,
            options: self.options,
            state: Mutex::new(WatcherState::default()),
            updates: updates_tx,
            shutdown: stop.clone(),
        });

        let gate = ReadinessGate::new();
        tokio::spawn(tracks::watch_ca_roots(shared.clone(), Some(gate.token(tracks::CA_TRACK))));
        tokio::spawn(tracks::watch_leaf(shared.clone(), Some(gate.token(tracks::LEAF_TRACK))));
        tokio::spawn(tracks::watch_proxy_definition(
            shared.clone(),
            Some(gate.token(tracks::PROXY_TRACK)),
        ));
        tokio::spawn(tracks::watch_service(shared.clone(), Some(gate.token(tracks::SERVICE_TRACK))));

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = gate.wait() => {}
        }
        tracing::info!("Mesh state ready");

        let result = publish(&shared, updates, &self.output).await;
        tracing::info!("Watcher stopped");
        result
    }
}
