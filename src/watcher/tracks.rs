//! Long-poll loops, one per watched resource.
//!
//! Every track follows the same shape: query with the current cursor,
//! compare the returned cursor, write into shared state under the lock when
//! it moved, and post a change signal. Errors reset the cursor and pause.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::mesh::types::{AgentService, CaRootList, MeshResult, QueryMeta, QueryOptions, UpstreamDefinition};
use crate::mesh::ControlPlane;
use crate::observability::metrics;
use crate::snapshot::CaPool;
use crate::watcher::ready::ReadyToken;
use crate::watcher::state::{LeafRecord, UpstreamRecord};
use crate::watcher::Shared;

pub const CA_TRACK: &str = "ca_roots";
pub const LEAF_TRACK: &str = "leaf";
pub const PROXY_TRACK: &str = "proxy";
pub const SERVICE_TRACK: &str = "service";
pub const UPSTREAM_TRACK: &str = "upstream";

/// Proxy config key overriding the inbound bind address.
pub const BIND_ADDRESS_KEY: &str = "bind_address";
/// Proxy config key overriding the local application address.
pub const LOCAL_SERVICE_ADDRESS_KEY: &str = "local_service_address";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_TARGET_ADDRESS: &str = "127.0.0.1";

/// Position in a blocking query's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Index(u64),
    Hash(String),
}

impl Cursor {
    fn options(&self, wait_time: Duration, datacenter: Option<String>) -> QueryOptions {
        let mut opts = match self {
            Cursor::Index(i) => QueryOptions::with_index(*i),
            Cursor::Hash(h) => QueryOptions::with_hash(h),
        };
        opts.wait_time = wait_time;
        opts.datacenter = datacenter;
        opts
    }

    /// Move to the cursor in `meta`; true if the content changed.
    fn advance(&mut self, meta: &QueryMeta) -> bool {
        match self {
            Cursor::Index(i) => {
                let changed = *i != meta.last_index;
                // An index going backwards means the server state was reset.
                *i = if meta.last_index < *i { 0 } else { meta.last_index };
                changed
            }
            Cursor::Hash(h) => {
                let changed = *h != meta.last_content_hash;
                *h = meta.last_content_hash.clone();
                changed
            }
        }
    }

    fn reset(&mut self) {
        match self {
            Cursor::Index(i) => *i = 0,
            Cursor::Hash(h) => h.clear(),
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = MeshResult<T>>,
) -> Option<MeshResult<T>> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = fut => Some(result),
    }
}

impl<C: ControlPlane> Shared<C> {
    /// Apply the error policy. Returns false if cancelled while paused.
    async fn back_off(&self, track: &'static str, cursor: &mut Cursor, cancel: &CancellationToken) -> bool {
        metrics::record_watch_error(track);
        cursor.reset();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.options.error_delay) => true,
        }
    }
}

fn arrive(ready: &mut Option<ReadyToken>) {
    if let Some(token) = ready.take() {
        token.arrive();
    }
}

/// Parse each root on its own so one bad PEM does not hide the others.
fn ca_bundle(roots: &CaRootList) -> (Vec<Vec<u8>>, CaPool) {
    let mut pems = Vec::with_capacity(roots.roots.len());
    let mut pool = CaPool::new();
    for root in &roots.roots {
        let pem = root.root_cert_pem.as_bytes();
        if pool.append_pem(pem) {
            pems.push(pem.to_vec());
        } else {
            tracing::warn!(root_id = %root.id, name = %root.name, "Skipping unparseable CA root");
        }
    }
    (pems, pool)
}

pub(crate) async fn watch_ca_roots<C: ControlPlane>(shared: Arc<Shared<C>>, mut ready: Option<ReadyToken>) {
    let cancel = shared.shutdown.clone();
    let mut cursor = Cursor::Index(0);

    loop {
        let opts = cursor.options(shared.options.wait_time, None);
        let Some(result) = until_cancelled(&cancel, shared.control.ca_roots(&opts)).await else {
            return;
        };

        match result {
            Ok((roots, meta)) => {
                if cursor.advance(&meta) {
                    let (pems, pool) = ca_bundle(&roots);
                    tracing::info!(roots = pems.len(), active_root = %roots.active_root_id, "CA roots updated");
                    {
                        let mut state = shared.lock();
                        state.ca_pems = pems;
                        state.ca_pool = pool;
                    }
                    shared.notify_changed();
                }
                arrive(&mut ready);
            }
            Err(e) => {
                tracing::error!(track = CA_TRACK, service = %shared.service_name, error = %e, "Error watching CA roots");
                if !shared.back_off(CA_TRACK, &mut cursor, &cancel).await {
                    return;
                }
            }
        }
    }
}

pub(crate) async fn watch_leaf<C: ControlPlane>(shared: Arc<Shared<C>>, mut ready: Option<ReadyToken>) {
    let cancel = shared.shutdown.clone();
    let mut cursor = Cursor::Index(0);

    loop {
        let opts = cursor.options(shared.options.wait_time, None);
        let query = shared.control.ca_leaf(&shared.service_name, &opts);
        let Some(result) = until_cancelled(&cancel, query).await else {
            return;
        };

        match result {
            Ok((leaf, meta)) => {
                if cursor.advance(&meta) {
                    tracing::info!(serial = %leaf.serial_number, "Leaf certificate updated");
                    shared.lock().leaf = Some(LeafRecord {
                        cert: leaf.cert_pem.into_bytes(),
                        key: leaf.private_key_pem.into_bytes(),
                    });
                    shared.notify_changed();
                }
                arrive(&mut ready);
            }
            Err(e) => {
                tracing::error!(track = LEAF_TRACK, service = %shared.service_name, error = %e, "Error watching leaf certificate");
                if !shared.back_off(LEAF_TRACK, &mut cursor, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Follows the sidecar's own registration: listener addresses and the set
/// of declared upstreams.
pub(crate) async fn watch_proxy_definition<C: ControlPlane>(shared: Arc<Shared<C>>, mut ready: Option<ReadyToken>) {
    let cancel = shared.shutdown.clone();
    let mut cursor = Cursor::Hash(String::new());

    loop {
        let opts = cursor.options(shared.options.wait_time, None);
        let query = shared.control.agent_service(&shared.proxy_id, &opts);
        let Some(result) = until_cancelled(&cancel, query).await else {
            return;
        };

        match result {
            Ok((svc, meta)) => {
                if cursor.advance(&meta) {
                    apply_proxy_definition(&shared, &svc);
                    shared.notify_changed();
                }
                arrive(&mut ready);
            }
            Err(e) => {
                tracing::error!(track = PROXY_TRACK, service = %shared.proxy_id, error = %e, "Error watching proxy registration");
                if !shared.back_off(PROXY_TRACK, &mut cursor, &cancel).await {
                    return;
                }
            }
        }
    }
}

fn apply_proxy_definition<C: ControlPlane>(shared: &Arc<Shared<C>>, svc: &AgentService) {
    let proxy = svc.proxy.clone().unwrap_or_default();
    let bind_address = proxy
        .config_str(BIND_ADDRESS_KEY)
        .unwrap_or(DEFAULT_BIND_ADDRESS)
        .to_string();
    let target_address = proxy
        .config_str(LOCAL_SERVICE_ADDRESS_KEY)
        .unwrap_or(DEFAULT_TARGET_ADDRESS)
        .to_string();
    let declared: BTreeMap<&str, &UpstreamDefinition> = proxy
        .upstreams
        .iter()
        .map(|u| (u.destination_name.as_str(), u))
        .collect();

    let mut started = Vec::new();
    {
        let mut state = shared.lock();
        state.downstream.local_bind_address = bind_address;
        state.downstream.local_bind_port = svc.port;
        state.downstream.target_address = target_address;

        // A datacenter change needs a fresh watch, so it counts as remove + add.
        state.upstreams.retain(|name, rec| {
            let keep = declared
                .get(name.as_str())
                .is_some_and(|def| def.datacenter == rec.datacenter);
            if !keep {
                rec.cancel.cancel();
                tracing::info!(upstream = %name, "Stopped watching upstream");
            }
            keep
        });

        for (name, def) in &declared {
            match state.upstreams.get_mut(*name) {
                Some(rec) => {
                    rec.local_bind_address = def.local_bind_address.clone();
                    rec.local_bind_port = def.local_bind_port;
                }
                None => {
                    let cancel = shared.shutdown.child_token();
                    state.upstreams.insert(
                        name.to_string(),
                        UpstreamRecord {
                            service: name.to_string(),
                            datacenter: def.datacenter.clone(),
                            local_bind_address: def.local_bind_address.clone(),
                            local_bind_port: def.local_bind_port,
                            entries: Vec::new(),
                            cancel: cancel.clone(),
                        },
                    );
                    started.push((name.to_string(), def.datacenter.clone(), cancel));
                }
            }
        }
    }

    for (service, datacenter, cancel) in started {
        tracing::info!(upstream = %service, datacenter = %datacenter, "Watching upstream");
        tokio::spawn(watch_upstream(shared.clone(), service, datacenter, cancel));
    }
}

/// Follows the application's registration for the port it listens on.
pub(crate) async fn watch_service<C: ControlPlane>(shared: Arc<Shared<C>>, mut ready: Option<ReadyToken>) {
    let cancel = shared.shutdown.clone();
    let mut cursor = Cursor::Hash(String::new());

    loop {
        let opts = cursor.options(shared.options.wait_time, None);
        let query = shared.control.agent_service(&shared.service_id, &opts);
        let Some(result) = until_cancelled(&cancel, query).await else {
            return;
        };

        match result {
            Ok((svc, meta)) => {
                if cursor.advance(&meta) {
                    tracing::debug!(port = svc.port, "Service port updated");
                    shared.lock().downstream.target_port = svc.port;
                    shared.notify_changed();
                }
                arrive(&mut ready);
            }
            Err(e) => {
                tracing::error!(track = SERVICE_TRACK, service = %shared.service_id, error = %e, "Error watching service registration");
                if !shared.back_off(SERVICE_TRACK, &mut cursor, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Health-checked endpoints of one upstream, until `cancel` fires.
pub(crate) async fn watch_upstream<C: ControlPlane>(
    shared: Arc<Shared<C>>,
    service: String,
    datacenter: String,
    cancel: CancellationToken,
) {
    let dc = (!datacenter.is_empty()).then(|| datacenter.clone());
    let mut cursor = Cursor::Index(0);

    loop {
        let opts = cursor.options(shared.options.wait_time, dc.clone());
        let Some(result) = until_cancelled(&cancel, shared.control.health_connect(&service, &opts)).await else {
            break;
        };

        match result {
            Ok((entries, meta)) => {
                if !cursor.advance(&meta) {
                    continue;
                }
                let accepted = {
                    let mut state = shared.lock();
                    // Removal cancels under this lock, so the check cannot race it.
                    match state.upstreams.get_mut(&service) {
                        Some(rec) if !cancel.is_cancelled() => {
                            rec.entries = entries;
                            true
                        }
                        _ => false,
                    }
                };
                if !accepted {
                    break;
                }
                tracing::debug!(upstream = %service, "Upstream endpoints updated");
                shared.notify_changed();
            }
            Err(e) => {
                tracing::error!(track = UPSTREAM_TRACK, service = %service, datacenter = %datacenter, error = %e, "Error watching upstream");
                if !shared.back_off(UPSTREAM_TRACK, &mut cursor, &cancel).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(upstream = %service, "Upstream watch stopped");
}
