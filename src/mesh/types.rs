//! Control-plane response types and query cursors.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Upper bound the control plane may block a query for.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(10 * 60);

/// Options for a blocking query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Block until the index moves past this value (0 = return immediately).
    pub wait_index: u64,
    /// Block until the content hash differs from this value (empty = return immediately).
    pub wait_hash: String,
    /// Maximum time the server may block.
    pub wait_time: Duration,
    /// Datacenter to query; the agent's own when unset.
    pub datacenter: Option<String>,
}

impl QueryOptions {
    pub fn with_index(index: u64) -> Self {
        Self {
            wait_index: index,
            wait_time: DEFAULT_WAIT_TIME,
            ..Default::default()
        }
    }

    pub fn with_hash(hash: &str) -> Self {
        Self {
            wait_hash: hash.to_string(),
            wait_time: DEFAULT_WAIT_TIME,
            ..Default::default()
        }
    }
}

/// Cursor returned alongside every query result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
    pub last_content_hash: String,
}

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Control plane answered with a non-success status.
    #[error("control plane returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    /// Response body or headers could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type for control-plane operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// A service registered on the local agent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub kind: String,
    pub address: String,
    pub port: u16,
    pub proxy: Option<AgentServiceProxy>,
}

/// Sidecar proxy registration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentServiceProxy {
    pub destination_service_name: String,
    #[serde(rename = "DestinationServiceID")]
    pub destination_service_id: String,
    pub config: HashMap<String, serde_json::Value>,
    pub upstreams: Vec<UpstreamDefinition>,
}

impl AgentServiceProxy {
    /// String value of a proxy config key, if present and a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// An upstream declared by a sidecar registration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpstreamDefinition {
    pub destination_type: String,
    pub destination_name: String,
    pub datacenter: String,
    pub local_bind_address: String,
    pub local_bind_port: u16,
}

/// The mesh CA roots.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CaRootList {
    #[serde(rename = "ActiveRootID")]
    pub active_root_id: String,
    pub roots: Vec<CaRoot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CaRoot {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "RootCertPEM")]
    pub root_cert_pem: String,
    pub active: bool,
}

/// A leaf certificate issued for a service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LeafCert {
    pub serial_number: String,
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: String,
    pub service: String,
}

/// One instance of a service, with node and health checks.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceEntry {
    pub node: Node,
    pub service: EntryService,
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Node {
    pub node: String,
    pub address: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct EntryService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub weights: Weights,
}

/// Load-balancing weights by health state.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Weights {
    pub passing: u32,
    pub warning: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct HealthCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: String,
}
