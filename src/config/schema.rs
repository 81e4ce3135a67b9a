//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the sidecar.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SidecarConfig {
    /// Id of the application service this sidecar fronts.
    pub service_id: String,

    /// Mesh control plane (local agent).
    pub consul: ConsulConfig,

    /// Proxy configuration API.
    pub dataplane: DataplaneConfig,

    /// Proxy-side settings baked into generated objects.
    pub haproxy: HaproxyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Control plane connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent HTTP address.
    pub address: String,

    /// ACL token sent with every query.
    pub token: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
        }
    }
}

/// Data plane API connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// API base address.
    pub address: String,

    pub username: String,

    pub password: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:5555".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HaproxyConfig {
    /// Syslog socket every frontend and backend logs to.
    pub log_socket: String,

    /// SPOE agent configuration used by the intentions filter.
    pub spoe_config: String,

    /// Where certificate bundles are written. Empty means a directory under
    /// the system temp dir.
    pub cert_dir: String,

    /// Gate inbound connections on intentions.
    pub enable_intentions: bool,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            log_socket: "/var/run/haproxy-log.sock".to_string(),
            spoe_config: String::new(),
            cert_dir: String::new(),
            enable_intentions: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9102".to_string(),
        }
    }
}

/// Admin endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve `/health` and `/status`.
    pub enabled: bool,

    /// Bearer token required by `/status`; open when unset.
    pub api_key: Option<String>,

    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
