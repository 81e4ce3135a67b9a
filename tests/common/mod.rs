//! Shared utilities for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use mesh_sidecar::mesh::types::{
    AgentService, AgentServiceProxy, CaRoot, CaRootList, EntryService, HealthCheck, LeafCert,
    Node, ServiceEntry, UpstreamDefinition, Weights,
};
use mesh_sidecar::mesh::{ControlPlane, MeshError, MeshResult, QueryMeta, QueryOptions};
use mesh_sidecar::reconciler::{CertError, CertPaths, CertStore};
use mesh_sidecar::snapshot::{CaPool, Downstream, Snapshot, TlsMaterial, Upstream, UpstreamEndpoint};

pub const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nAAECAw==\n-----END CERTIFICATE-----\n";

// ---------------------------------------------------------------------------
// Fake control plane
// ---------------------------------------------------------------------------

/// A value with a modify index, served with blocking-query semantics.
#[derive(Clone)]
struct Resource<T> {
    tx: Arc<watch::Sender<(Option<T>, u64)>>,
}

impl<T: Clone> Resource<T> {
    fn empty() -> Self {
        let (tx, _) = watch::channel((None, 0));
        Self { tx: Arc::new(tx) }
    }

    fn with(value: T) -> Self {
        let (tx, _) = watch::channel((Some(value), 1));
        Self { tx: Arc::new(tx) }
    }

    fn set(&self, value: T) {
        self.tx.send_modify(move |(v, i)| {
            *v = Some(value);
            *i += 1;
        });
    }

    /// Return at once unless the caller's cursor is current; then wait for
    /// a change or the wait time.
    async fn query(&self, opts: &QueryOptions, what: &str) -> MeshResult<(T, QueryMeta)> {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::sleep(opts.wait_time);
        tokio::pin!(deadline);

        loop {
            let (value, index) = rx.borrow_and_update().clone();
            let current = (opts.wait_index != 0 && opts.wait_index == index)
                || (!opts.wait_hash.is_empty() && opts.wait_hash == index.to_string());
            if !current {
                return finish(value, index, what);
            }
            tokio::select! {
                _ = &mut deadline => return finish(value, index, what),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return finish(value, index, what);
                    }
                }
            }
        }
    }
}

fn finish<T>(value: Option<T>, index: u64, what: &str) -> MeshResult<(T, QueryMeta)> {
    let meta = QueryMeta {
        last_index: index,
        last_content_hash: index.to_string(),
    };
    value
        .map(|v| (v, meta))
        .ok_or_else(|| MeshError::NotFound(what.to_string()))
}

/// Decrements the in-flight count for a health watch when dropped.
struct InFlight {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    service: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(n) = counts.get_mut(&self.service) {
            *n -= 1;
        }
    }
}

#[derive(Default)]
struct FakeInner {
    proxy_ids: Mutex<HashMap<String, String>>,
    services: Mutex<HashMap<String, Resource<AgentService>>>,
    health: Mutex<HashMap<String, Resource<Vec<ServiceEntry>>>>,
    ca: Mutex<Option<Resource<CaRootList>>>,
    leaf: Mutex<Option<Resource<LeafCert>>>,
    failures: Mutex<HashMap<&'static str, usize>>,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    queries: Mutex<Vec<SeenQuery>>,
}

/// One blocking query as the fake received it.
#[derive(Debug, Clone)]
pub struct SeenQuery {
    pub kind: &'static str,
    pub target: String,
    pub opts: QueryOptions,
    /// Answered with an injected failure.
    pub failed: bool,
}

/// Scripted control plane. Clones share state.
#[derive(Clone, Default)]
pub struct FakeMesh {
    inner: Arc<FakeInner>,
}

impl FakeMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_proxy(&self, service_id: &str, proxy_id: &str) {
        self.inner
            .proxy_ids
            .lock()
            .unwrap()
            .insert(service_id.to_string(), proxy_id.to_string());
    }

    pub fn set_service(&self, svc: AgentService) {
        self.service_resource(&svc.id).set(svc);
    }

    pub fn set_ca_roots(&self, roots: CaRootList) {
        self.ca_resource().set(roots);
    }

    pub fn set_leaf(&self, leaf: LeafCert) {
        self.leaf_resource().set(leaf);
    }

    pub fn set_health(&self, service: &str, entries: Vec<ServiceEntry>) {
        self.health_resource(service).set(entries);
    }

    /// Fail the next `count` queries of `kind` (`ca`, `leaf`, `service`, `health`).
    pub fn fail_next(&self, kind: &'static str, count: usize) {
        self.inner.failures.lock().unwrap().insert(kind, count);
    }

    /// Health watches currently blocked on `service`.
    pub fn health_in_flight(&self, service: &str) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// Every health query made so far, with its datacenter.
    pub fn health_queries(&self) -> Vec<(String, Option<String>)> {
        self.queries("health")
            .into_iter()
            .map(|q| (q.target, q.opts.datacenter))
            .collect()
    }

    /// Every query of `kind` made so far, in arrival order.
    pub fn queries(&self, kind: &str) -> Vec<SeenQuery> {
        self.inner
            .queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.kind == kind)
            .cloned()
            .collect()
    }

    /// Options of each query of `kind` that directly follows a failed query
    /// against the same target.
    pub fn retries_after_failure(&self, kind: &str) -> Vec<QueryOptions> {
        let queries = self.queries(kind);
        let mut retries = Vec::new();
        for (i, failed) in queries.iter().enumerate().filter(|(_, q)| q.failed) {
            if let Some(next) = queries[i + 1..].iter().find(|q| q.target == failed.target) {
                retries.push(next.opts.clone());
            }
        }
        retries
    }

    /// Record the query, then fail it if a failure of `kind` is pending.
    fn take_failure(&self, kind: &'static str, target: &str, opts: &QueryOptions) -> MeshResult<()> {
        let mut failures = self.inner.failures.lock().unwrap();
        let failed = match failures.get_mut(kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        self.inner.queries.lock().unwrap().push(SeenQuery {
            kind,
            target: target.to_string(),
            opts: opts.clone(),
            failed,
        });
        if failed {
            return Err(MeshError::Status {
                path: kind.to_string(),
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn service_resource(&self, id: &str) -> Resource<AgentService> {
        self.inner
            .services
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(Resource::empty)
            .clone()
    }

    fn health_resource(&self, service: &str) -> Resource<Vec<ServiceEntry>> {
        self.inner
            .health
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_insert_with(|| Resource::with(Vec::new()))
            .clone()
    }

    fn ca_resource(&self) -> Resource<CaRootList> {
        self.inner
            .ca
            .lock()
            .unwrap()
            .get_or_insert_with(Resource::empty)
            .clone()
    }

    fn leaf_resource(&self) -> Resource<LeafCert> {
        self.inner
            .leaf
            .lock()
            .unwrap()
            .get_or_insert_with(Resource::empty)
            .clone()
    }
}

#[async_trait]
impl ControlPlane for FakeMesh {
    async fn sidecar_proxy_id(&self, service_id: &str) -> MeshResult<String> {
        self.inner
            .proxy_ids
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(format!("sidecar for {}", service_id)))
    }

    async fn agent_service(
        &self,
        service_id: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(AgentService, QueryMeta)> {
        self.take_failure("service", service_id, opts)?;
        let resource = self.service_resource(service_id);
        resource.query(opts, service_id).await
    }

    async fn ca_roots(&self, opts: &QueryOptions) -> MeshResult<(CaRootList, QueryMeta)> {
        self.take_failure("ca", "", opts)?;
        let resource = self.ca_resource();
        resource.query(opts, "ca roots").await
    }

    async fn ca_leaf(&self, service: &str, opts: &QueryOptions) -> MeshResult<(LeafCert, QueryMeta)> {
        self.take_failure("leaf", service, opts)?;
        let resource = self.leaf_resource();
        resource.query(opts, service).await
    }

    async fn health_connect(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(Vec<ServiceEntry>, QueryMeta)> {
        self.take_failure("health", service, opts)?;

        *self
            .inner
            .in_flight
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_insert(0) += 1;
        let _guard = InFlight {
            counts: self.inner.in_flight.clone(),
            service: service.to_string(),
        };

        let resource = self.health_resource(service);
        resource.query(opts, service).await
    }
}

// ---------------------------------------------------------------------------
// Control plane fixtures
// ---------------------------------------------------------------------------

pub fn app_service(id: &str, name: &str, port: u16) -> AgentService {
    AgentService {
        id: id.to_string(),
        service: name.to_string(),
        kind: String::new(),
        address: String::new(),
        port,
        proxy: None,
    }
}

pub fn upstream_def(name: &str, port: u16) -> UpstreamDefinition {
    UpstreamDefinition {
        destination_type: "service".to_string(),
        destination_name: name.to_string(),
        datacenter: String::new(),
        local_bind_address: String::new(),
        local_bind_port: port,
    }
}

pub fn proxy_service(
    id: &str,
    destination: &str,
    port: u16,
    upstreams: Vec<UpstreamDefinition>,
) -> AgentService {
    AgentService {
        id: id.to_string(),
        service: format!("{}-sidecar-proxy", destination),
        kind: "connect-proxy".to_string(),
        address: String::new(),
        port,
        proxy: Some(AgentServiceProxy {
            destination_service_name: destination.to_string(),
            destination_service_id: destination.to_string(),
            config: HashMap::new(),
            upstreams,
        }),
    }
}

pub fn ca_roots() -> CaRootList {
    CaRootList {
        active_root_id: "root-1".to_string(),
        roots: vec![CaRoot {
            id: "root-1".to_string(),
            name: "Mesh CA".to_string(),
            root_cert_pem: CA_PEM.to_string(),
            active: true,
        }],
    }
}

pub fn leaf_cert(serial: &str) -> LeafCert {
    LeafCert {
        serial_number: serial.to_string(),
        cert_pem: format!("cert-{}", serial),
        private_key_pem: format!("key-{}", serial),
        service: "web".to_string(),
    }
}

pub fn service_entry(service: &str, address: &str, port: u16, status: &str) -> ServiceEntry {
    ServiceEntry {
        node: Node {
            node: format!("node-{}", address),
            address: address.to_string(),
            datacenter: "dc1".to_string(),
        },
        service: EntryService {
            id: format!("{}-{}", service, address),
            service: format!("{}-sidecar-proxy", service),
            address: address.to_string(),
            port,
            weights: Weights {
                passing: 1,
                warning: 1,
            },
        },
        checks: vec![HealthCheck {
            check_id: "serf".to_string(),
            name: "Serf Health".to_string(),
            status: status.to_string(),
        }],
    }
}

/// A mesh where `web-1` (port 8080) has a sidecar `web-1-sidecar-proxy`
/// listening on 21000 with the given upstreams, plus CA roots and a leaf.
pub fn ready_mesh(upstreams: Vec<UpstreamDefinition>) -> FakeMesh {
    let mesh = FakeMesh::new();
    mesh.register_proxy("web-1", "web-1-sidecar-proxy");
    mesh.set_service(app_service("web-1", "web", 8080));
    mesh.set_service(proxy_service("web-1-sidecar-proxy", "web", 21000, upstreams));
    mesh.set_ca_roots(ca_roots());
    mesh.set_leaf(leaf_cert("01"));
    mesh
}

// ---------------------------------------------------------------------------
// Snapshot fixtures
// ---------------------------------------------------------------------------

pub fn tls() -> TlsMaterial {
    TlsMaterial {
        cas: vec![CA_PEM.as_bytes().to_vec()],
        cert: b"cert".to_vec(),
        key: b"key".to_vec(),
    }
}

pub fn endpoint(host: &str, port: u16) -> UpstreamEndpoint {
    UpstreamEndpoint {
        host: host.to_string(),
        port,
        weight: 1,
    }
}

pub fn upstream(service: &str, bind_port: u16, endpoints: Vec<UpstreamEndpoint>) -> Upstream {
    Upstream {
        service: service.to_string(),
        local_bind_address: "127.0.0.1".to_string(),
        local_bind_port: bind_port,
        tls: tls(),
        endpoints,
    }
}

pub fn snapshot(bind_port: u16, target_port: u16, upstreams: Vec<Upstream>) -> Snapshot {
    Snapshot {
        service_name: "web".to_string(),
        service_id: "web-1".to_string(),
        ca_pool: CaPool::new(),
        downstream: Downstream {
            local_bind_address: "0.0.0.0".to_string(),
            local_bind_port: bind_port,
            target_address: "127.0.0.1".to_string(),
            target_port,
            tls: tls(),
        },
        upstreams,
    }
}

/// Hands out fixed paths without touching the filesystem.
pub struct StaticCerts;

impl CertStore for StaticCerts {
    fn certs_path(&self, _tls: &TlsMaterial) -> Result<CertPaths, CertError> {
        Ok(CertPaths {
            certificate: "/certs/leaf.pem".into(),
            ca_file: "/certs/ca.pem".into(),
        })
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Raw HTTP backend
// ---------------------------------------------------------------------------

/// A request as seen by a programmable backend.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Response from a programmable backend: status, extra headers, body.
pub type Reply = (u16, Vec<(&'static str, String)>, String);

/// Start a programmable backend on an ephemeral port. Each request is handed
/// to `f` and recorded.
pub async fn start_programmable_backend<F, Fut>(f: F) -> (SocketAddr, Arc<Mutex<Vec<SeenRequest>>>)
where
    F: Fn(SeenRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let recorded = seen.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        recorded.lock().unwrap().push(request.clone());
                        let (status, headers, body) = f(request).await;

                        let mut response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n",
                            status,
                            reason(status),
                            body.len()
                        );
                        for (name, value) in headers {
                            response.push_str(&format!("{}: {}\r\n", name, value));
                        }
                        response.push_str("\r\n");
                        response.push_str(&body);
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, seen)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    Some(SeenRequest {
        method,
        target,
        headers,
        body,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
