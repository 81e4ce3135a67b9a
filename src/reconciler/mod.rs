//! Snapshot → proxy configuration.
//!
//! # Data Flow
//! ```text
//! snapshot channel
//!     → plan (diff against last committed snapshot, or after a failed
//!       pass, against the frontends/backends listed by the store)
//!     → nothing changed: done, no transaction
//!     → otherwise, inside one transaction:
//!         downstream.rs (teardown + rebuild of the inbound listener)
//!         upstream.rs   (per-upstream teardown + rebuild)
//!     → commit
//! ```
//!
//! # Design Decisions
//! - Level triggered: every snapshot carries the full desired state
//! - Previous state is the last *committed* snapshot, so an aborted pass can
//!   never make the short-circuit skip a needed rebuild
//! - After a failed pass the store's contents are unknown (a commit may land
//!   with its reply lost). The next pass re-reads the version and the
//!   frontend/backend names, and rebuilds everything from that listing
//! - Upstreams are diffed independently of the downstream listener

pub mod certs;
pub mod downstream;
pub mod status;
pub mod upstream;

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dataplane::models::{LogFacility, LogFormat, LogTarget};
use crate::dataplane::{DataplaneClient, DataplaneError, Transaction, Transport};
use crate::observability::metrics;
use crate::snapshot::{Snapshot, Upstream};

pub use certs::{CertError, CertPaths, CertStore, FileCertStore};
pub use status::{ReconcileStatus, StatusHandle};

/// Client, server and connect timeouts, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("dataplane: {0}")]
    Dataplane(#[from] DataplaneError),

    #[error("certificates: {0}")]
    Certs(#[from] CertError),
}

/// Reconciler settings that are not part of the snapshot.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Gate inbound connections on the intentions SPOE agent.
    pub enable_intentions: bool,
    /// Path of the SPOE agent configuration.
    pub spoe_config: String,
    /// Syslog socket the proxy logs to.
    pub log_socket: String,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            enable_intentions: false,
            spoe_config: String::new(),
            log_socket: "/var/run/haproxy-log.sock".to_string(),
        }
    }
}

pub(crate) fn log_target(opts: &ReconcilerOptions) -> LogTarget {
    LogTarget {
        id: 0,
        address: opts.log_socket.clone(),
        facility: LogFacility::Local0,
        format: LogFormat::Rfc5424,
    }
}

/// Result of one `apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Desired state matches what is committed; the store was not touched.
    Unchanged,
    /// A transaction was committed.
    Applied {
        version: u64,
        downstream: bool,
        upstreams_rebuilt: usize,
        upstreams_removed: usize,
    },
}

/// Which objects of one listener are present in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Existing {
    pub frontend: bool,
    pub backend: bool,
}

impl Existing {
    pub const NONE: Existing = Existing {
        frontend: false,
        backend: false,
    };
    pub const BOTH: Existing = Existing {
        frontend: true,
        backend: true,
    };
}

/// Frontend and backend names read back from the store.
#[derive(Debug, Default)]
struct Inventory {
    frontends: BTreeSet<String>,
    backends: BTreeSet<String>,
}

impl Inventory {
    fn listener(&self, frontend: &str, backend: &str) -> Existing {
        Existing {
            frontend: self.frontends.contains(frontend),
            backend: self.backends.contains(backend),
        }
    }

    fn upstream(&self, service: &str) -> Existing {
        self.listener(&upstream::frontend_name(service), &upstream::backend_name(service))
    }

    /// Upstream services with at least one object in the store.
    fn upstream_services(&self) -> BTreeSet<&str> {
        let frontends = self
            .frontends
            .iter()
            .filter_map(|n| n.strip_prefix(upstream::FRONTEND_PREFIX));
        let backends = self
            .backends
            .iter()
            .filter_map(|n| n.strip_prefix(upstream::BACKEND_PREFIX));
        frontends.chain(backends).collect()
    }
}

/// Changes needed to go from one state to the next.
#[derive(Debug, Default)]
struct Plan {
    /// Rebuild the downstream listener after deleting what exists of it.
    downstream: Option<Existing>,
    /// Upstreams to delete.
    removed: Vec<(String, Existing)>,
    /// Upstreams to (re)build.
    rebuilt: Vec<(String, Existing)>,
}

impl Plan {
    /// Diff against the last committed snapshot.
    fn between(prev: Option<&Snapshot>, next: &Snapshot) -> Self {
        let mut plan = Plan::default();

        match prev {
            None => plan.downstream = Some(Existing::NONE),
            Some(p) if p.downstream != next.downstream => plan.downstream = Some(Existing::BOTH),
            Some(_) => {}
        }

        let before: BTreeMap<&str, &Upstream> = prev
            .map(|p| p.upstreams.iter().map(|u| (u.service.as_str(), u)).collect())
            .unwrap_or_default();

        for up in &next.upstreams {
            match before.get(up.service.as_str()) {
                Some(old) if *old == up => {}
                Some(_) => plan.rebuilt.push((up.service.clone(), Existing::BOTH)),
                None => plan.rebuilt.push((up.service.clone(), Existing::NONE)),
            }
        }
        for name in before.keys() {
            if next.upstream(name).is_none() {
                plan.removed.push((name.to_string(), Existing::BOTH));
            }
        }

        plan
    }

    /// Rebuild everything in `next` against what the store actually holds.
    fn from_store(store: &Inventory, next: &Snapshot) -> Self {
        let mut plan = Plan {
            downstream: Some(store.listener(downstream::FRONTEND_NAME, downstream::BACKEND_NAME)),
            ..Default::default()
        };

        for up in &next.upstreams {
            plan.rebuilt.push((up.service.clone(), store.upstream(&up.service)));
        }
        for name in store.upstream_services() {
            if next.upstream(name).is_none() {
                plan.removed.push((name.to_string(), store.upstream(name)));
            }
        }

        plan
    }

    fn is_empty(&self) -> bool {
        self.downstream.is_none() && self.removed.is_empty() && self.rebuilt.is_empty()
    }
}

/// Applies snapshots to the proxy, one transaction per change.
pub struct Reconciler<T, C> {
    client: DataplaneClient<T>,
    certs: C,
    options: ReconcilerOptions,
    applied: Option<Snapshot>,
    force: bool,
    status: StatusHandle,
}

impl<T: Transport, C: CertStore> Reconciler<T, C> {
    pub fn new(client: DataplaneClient<T>, certs: C, options: ReconcilerOptions) -> Self {
        Self {
            client,
            certs,
            options,
            applied: None,
            force: false,
            status: StatusHandle::new(),
        }
    }

    /// Publish progress through `status`.
    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = status;
        self
    }

    pub fn client(&self) -> &DataplaneClient<T> {
        &self.client
    }

    /// Last committed snapshot.
    pub fn applied(&self) -> Option<&Snapshot> {
        self.applied.as_ref()
    }

    /// Bring the proxy in line with `next`.
    pub async fn apply(&mut self, next: Snapshot) -> Result<ApplyOutcome, ReconcileError> {
        let plan = if self.force {
            self.resync(&next).await?
        } else {
            Plan::between(self.applied.as_ref(), &next)
        };
        if plan.is_empty() {
            tracing::debug!(service = %next.service_name, "Snapshot unchanged, skipping");
            return Ok(ApplyOutcome::Unchanged);
        }

        match self.transact(&plan, &next).await {
            Ok(version) => {
                self.force = false;
                self.certs.retain_committed(&next.tls_materials());
                self.applied = Some(next);
                Ok(ApplyOutcome::Applied {
                    version,
                    downstream: plan.downstream.is_some(),
                    upstreams_rebuilt: plan.rebuilt.len(),
                    upstreams_removed: plan.removed.len(),
                })
            }
            Err(e) => {
                self.force = true;
                if matches!(&e, ReconcileError::Dataplane(d) if d.is_version_conflict()) {
                    if let Err(refresh_err) = self.client.refresh_version().await {
                        tracing::warn!(error = %refresh_err, "Failed to refresh dataplane version");
                    }
                }
                Err(e)
            }
        }
    }

    /// Re-read the store after a failed pass. A commit may have landed even
    /// though it was reported as failed, so the last committed snapshot no
    /// longer says which objects exist.
    async fn resync(&self, next: &Snapshot) -> Result<Plan, ReconcileError> {
        self.client.refresh_version().await?;
        let store = Inventory {
            frontends: self.client.list_names("frontends").await?,
            backends: self.client.list_names("backends").await?,
        };
        tracing::info!(
            frontends = store.frontends.len(),
            backends = store.backends.len(),
            "Rebuilding from store contents after a failed pass"
        );
        Ok(Plan::from_store(&store, next))
    }

    /// Stage `plan` in a fresh transaction and commit it; returns the new version.
    async fn transact(&self, plan: &Plan, next: &Snapshot) -> Result<u64, ReconcileError> {
        let tx = self.client.begin().await?;
        let opened_at = tx.version();

        if let Err(e) = self.stage(&tx, plan, next).await {
            let id = tx.id().to_string();
            if let Err(abort_err) = tx.abort().await {
                tracing::warn!(transaction_id = %id, error = %abort_err, "Failed to abort transaction");
            }
            return Err(e);
        }

        tx.commit().await?;
        Ok(opened_at + 1)
    }

    async fn stage(
        &self,
        tx: &Transaction<'_, T>,
        plan: &Plan,
        next: &Snapshot,
    ) -> Result<(), ReconcileError> {
        if let Some(existing) = plan.downstream {
            downstream::teardown(tx, existing).await?;
            downstream::build(tx, &next.downstream, &self.certs, &self.options).await?;
        }

        for (name, existing) in &plan.removed {
            tracing::info!(upstream = %name, "Removing upstream");
            upstream::teardown(tx, name, *existing).await?;
        }

        for (name, existing) in &plan.rebuilt {
            upstream::teardown(tx, name, *existing).await?;
            if let Some(up) = next.upstream(name) {
                upstream::build(tx, up, &self.certs, &self.options).await?;
            }
        }

        Ok(())
    }

    /// Apply snapshots in arrival order until the channel closes or shutdown.
    pub async fn run(mut self, mut snapshots: mpsc::Receiver<Snapshot>, shutdown: CancellationToken) {
        tracing::info!("Reconciler started");

        loop {
            let snapshot = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = snapshots.recv() => match next {
                    Some(s) => s,
                    None => break,
                },
            };

            let upstreams = snapshot.upstreams.len();
            match self.apply(snapshot).await {
                Ok(ApplyOutcome::Unchanged) => {
                    metrics::record_reconcile("unchanged");
                }
                Ok(ApplyOutcome::Applied {
                    version,
                    downstream,
                    upstreams_rebuilt,
                    upstreams_removed,
                }) => {
                    tracing::info!(
                        version,
                        downstream,
                        upstreams_rebuilt,
                        upstreams_removed,
                        "Proxy configuration applied"
                    );
                    metrics::record_reconcile("applied");
                    metrics::record_dataplane_version(version);
                    metrics::record_upstreams(upstreams);
                    if let Some(applied) = &self.applied {
                        self.status.applied(applied, version);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to apply proxy configuration");
                    metrics::record_reconcile("error");
                    self.status.failed(&e.to_string());
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}
