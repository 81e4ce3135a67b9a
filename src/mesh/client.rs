//! Control-plane client.
//!
//! # Responsibilities
//! - Define the blocking-query surface the watcher depends on
//! - Implement it against the Consul agent HTTP API
//!
//! # Design Decisions
//! - Every query returns a fresh cursor; the caller owns cursor state
//! - No retries here: the watcher's error policy decides what to do

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::mesh::types::{
    AgentService, CaRootList, LeafCert, MeshError, MeshResult, QueryMeta, QueryOptions,
    ServiceEntry,
};

const INDEX_HEADER: &str = "x-consul-index";
const CONTENT_HASH_HEADER: &str = "x-consul-contenthash";
const TOKEN_HEADER: &str = "x-consul-token";

/// Which cursor header an endpoint must answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorHeader {
    Index,
    ContentHash,
    /// Not a blocking endpoint.
    None,
}

/// Blocking queries against the mesh control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Resolve the id of the sidecar proxy registered for `service_id`.
    async fn sidecar_proxy_id(&self, service_id: &str) -> MeshResult<String>;

    /// A service registered on the local agent (content-hash cursor).
    async fn agent_service(
        &self,
        service_id: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(AgentService, QueryMeta)>;

    /// Mesh CA roots (index cursor).
    async fn ca_roots(&self, opts: &QueryOptions) -> MeshResult<(CaRootList, QueryMeta)>;

    /// Leaf certificate for `service` (index cursor).
    async fn ca_leaf(&self, service: &str, opts: &QueryOptions) -> MeshResult<(LeafCert, QueryMeta)>;

    /// Mesh-capable instances of `service` with their health checks (index cursor).
    async fn health_connect(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(Vec<ServiceEntry>, QueryMeta)>;
}

/// Consul agent HTTP client.
#[derive(Clone)]
pub struct ConsulClient {
    base_url: url::Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl ConsulClient {
    pub fn new(address: &str, token: Option<String>) -> MeshResult<Self> {
        let base_url = url::Url::parse(address)
            .map_err(|e| MeshError::Decode(format!("invalid consul address '{}': {}", address, e)))?;
        // Long polls are bounded server side; the client only guards the connect.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: &QueryOptions,
        cursor: CursorHeader,
    ) -> MeshResult<(T, QueryMeta)> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| MeshError::Decode(format!("invalid path '{}': {}", path, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if opts.wait_index > 0 {
                query.append_pair("index", &opts.wait_index.to_string());
            }
            if !opts.wait_hash.is_empty() {
                query.append_pair("hash", &opts.wait_hash);
            }
            if !opts.wait_time.is_zero() {
                query.append_pair("wait", &format!("{}ms", opts.wait_time.as_millis()));
            }
            if let Some(dc) = opts.datacenter.as_deref().filter(|dc| !dc.is_empty()) {
                query.append_pair("dc", dc);
            }
        }

        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        tracing::trace!(path = %path, index = opts.wait_index, hash = %opts.wait_hash, "Consul query");
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MeshError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let meta = query_meta(response.headers(), cursor)
            .map_err(|e| MeshError::Decode(format!("{}: {}", path, e)))?;
        let value = response
            .json::<T>()
            .await
            .map_err(|e| MeshError::Decode(format!("{}: {}", path, e)))?;
        Ok((value, meta))
    }
}

/// Read the cursor headers. A blocking endpoint that answers without its
/// cursor would leave the caller re-querying in a tight loop.
fn query_meta(headers: &HeaderMap, cursor: CursorHeader) -> Result<QueryMeta, String> {
    let last_index = match headers.get(INDEX_HEADER) {
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("bad {} header", INDEX_HEADER))?,
        None if cursor == CursorHeader::Index => {
            return Err(format!("missing {} header", INDEX_HEADER));
        }
        None => 0,
    };
    let last_content_hash = match headers.get(CONTENT_HASH_HEADER) {
        Some(v) => v
            .to_str()
            .map_err(|_| format!("bad {} header", CONTENT_HASH_HEADER))?
            .to_string(),
        None if cursor == CursorHeader::ContentHash => {
            return Err(format!("missing {} header", CONTENT_HASH_HEADER));
        }
        None => String::new(),
    };
    Ok(QueryMeta {
        last_index,
        last_content_hash,
    })
}

#[async_trait]
impl ControlPlane for ConsulClient {
    async fn sidecar_proxy_id(&self, service_id: &str) -> MeshResult<String> {
        let (services, _) = self
            .get::<HashMap<String, AgentService>>(
                "/v1/agent/services",
                &QueryOptions::default(),
                CursorHeader::None,
            )
            .await?;
        let mut candidates = services.into_values().filter(|svc| {
            svc.kind == "connect-proxy"
                && svc
                    .proxy
                    .as_ref()
                    .is_some_and(|p| p.destination_service_id == service_id)
        });

        match (candidates.next(), candidates.next()) {
            (Some(proxy), None) => Ok(proxy.id),
            (None, _) => Err(MeshError::NotFound(format!(
                "no sidecar proxy registered for service {}",
                service_id
            ))),
            (Some(_), Some(_)) => Err(MeshError::Decode(format!(
                "more than one sidecar proxy registered for service {}",
                service_id
            ))),
        }
    }

    async fn agent_service(
        &self,
        service_id: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(AgentService, QueryMeta)> {
        self.get(&format!("/v1/agent/service/{}", service_id), opts, CursorHeader::ContentHash)
            .await
    }

    async fn ca_roots(&self, opts: &QueryOptions) -> MeshResult<(CaRootList, QueryMeta)> {
        self.get("/v1/agent/connect/ca/roots", opts, CursorHeader::Index).await
    }

    async fn ca_leaf(&self, service: &str, opts: &QueryOptions) -> MeshResult<(LeafCert, QueryMeta)> {
        self.get(&format!("/v1/agent/connect/ca/leaf/{}", service), opts, CursorHeader::Index)
            .await
    }

    async fn health_connect(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> MeshResult<(Vec<ServiceEntry>, QueryMeta)> {
        self.get(&format!("/v1/health/connect/{}", service), opts, CursorHeader::Index)
            .await
    }
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("address", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
