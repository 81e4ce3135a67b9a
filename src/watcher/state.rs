//! Mutable mesh state shared by the watch tracks.

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::mesh::health::select_endpoints;
use crate::mesh::types::ServiceEntry;
use crate::snapshot::{CaPool, Downstream, Snapshot, TlsMaterial, Upstream};

/// One declared upstream and the latest health entries seen for it.
#[derive(Debug)]
pub struct UpstreamRecord {
    pub service: String,
    pub datacenter: String,
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub entries: Vec<ServiceEntry>,
    /// Stops the endpoint watch for this upstream.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct DownstreamRecord {
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub target_address: String,
    pub target_port: u16,
}

#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Everything the tracks have learned so far.
#[derive(Debug, Default)]
pub struct WatcherState {
    pub upstreams: BTreeMap<String, UpstreamRecord>,
    pub downstream: DownstreamRecord,
    pub ca_pems: Vec<Vec<u8>>,
    pub ca_pool: CaPool,
    pub leaf: Option<LeafRecord>,
}

impl WatcherState {
    /// Freeze the current state into a snapshot. `None` until a leaf
    /// certificate is known.
    pub fn snapshot(&self, service_name: &str, service_id: &str) -> Option<Snapshot> {
        let leaf = self.leaf.as_ref()?;
        let tls = TlsMaterial {
            cas: self.ca_pems.clone(),
            cert: leaf.cert.clone(),
            key: leaf.key.clone(),
        };

        let ds = &self.downstream;
        let downstream = Downstream {
            local_bind_address: ds.local_bind_address.clone(),
            local_bind_port: ds.local_bind_port,
            target_address: ds.target_address.clone(),
            target_port: ds.target_port,
            tls: tls.clone(),
        };

        // BTreeMap iteration keeps upstreams sorted by service name.
        let upstreams = self
            .upstreams
            .values()
            .map(|rec| Upstream {
                service: rec.service.clone(),
                local_bind_address: rec.local_bind_address.clone(),
                local_bind_port: rec.local_bind_port,
                tls: tls.clone(),
                endpoints: select_endpoints(&rec.entries),
            })
            .collect();

        Some(Snapshot {
            service_name: service_name.to_string(),
            service_id: service_id.to_string(),
            ca_pool: self.ca_pool.clone(),
            downstream,
            upstreams,
        })
    }
}
