//! Reconciliation status shared with the admin endpoints.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;

use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DownstreamStatus {
    pub bind: String,
    pub target: String,
}

/// What the proxy currently runs, as far as the reconciler knows.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconcileStatus {
    /// True once a snapshot has been committed.
    pub ready: bool,
    /// Store version after the last commit.
    pub version: u64,
    pub service: Option<String>,
    pub downstream: Option<DownstreamStatus>,
    pub upstreams: Vec<String>,
    pub last_error: Option<String>,
}

/// Lock-free handle to the latest status.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<ReconcileStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(ReconcileStatus::default())),
        }
    }

    pub fn load(&self) -> Arc<ReconcileStatus> {
        self.inner.load_full()
    }

    /// Record a successful commit of `snapshot` at `version`.
    pub fn applied(&self, snapshot: &Snapshot, version: u64) {
        let ds = &snapshot.downstream;
        self.inner.store(Arc::new(ReconcileStatus {
            ready: true,
            version,
            service: Some(snapshot.service_name.clone()),
            downstream: Some(DownstreamStatus {
                bind: format!("{}:{}", ds.local_bind_address, ds.local_bind_port),
                target: format!("{}:{}", ds.target_address, ds.target_port),
            }),
            upstreams: snapshot.upstreams.iter().map(|u| u.service.clone()).collect(),
            last_error: None,
        }));
    }

    /// Record a failed pass, keeping what was last applied.
    pub fn failed(&self, error: &str) {
        self.inner.rcu(|current| {
            let mut next = ReconcileStatus::clone(current);
            next.last_error = Some(error.to_string());
            next
        });
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
