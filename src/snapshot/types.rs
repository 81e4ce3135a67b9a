//! Snapshot value types.

use std::collections::BTreeSet;

/// A validated pool of trusted CA certificates (DER encoded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaPool {
    certs: Vec<Vec<u8>>,
}

impl CaPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every certificate in a PEM bundle and add it to the pool.
    ///
    /// Returns false if the bundle held no parseable certificate.
    pub fn append_pem(&mut self, pem: &[u8]) -> bool {
        let mut reader = pem;
        let mut added = false;
        for cert in rustls_pemfile::certs(&mut reader) {
            match cert {
                Ok(der) => {
                    self.certs.push(der.as_ref().to_vec());
                    added = true;
                }
                Err(_) => return false,
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// DER bytes of every certificate in the pool.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certs
    }
}

/// Certificates presented and trusted by one proxy listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsMaterial {
    /// CA certificates (PEM), in the order the mesh returned them.
    pub cas: Vec<Vec<u8>>,
    /// Leaf certificate (PEM).
    pub cert: Vec<u8>,
    /// Leaf private key (PEM).
    pub key: Vec<u8>,
}

/// Where mesh traffic enters this node and where it goes after TLS termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downstream {
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub tls: TlsMaterial,
}

/// One weighted endpoint of an upstream service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpstreamEndpoint {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// A remote service exposed to local callers by the proxy.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub service: String,
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub tls: TlsMaterial,
    pub endpoints: Vec<UpstreamEndpoint>,
}

impl Upstream {
    /// Endpoints as a set; order carries no meaning for the proxy.
    pub fn endpoint_set(&self) -> BTreeSet<&UpstreamEndpoint> {
        self.endpoints.iter().collect()
    }
}

impl PartialEq for Upstream {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service
            && self.local_bind_address == other.local_bind_address
            && self.local_bind_port == other.local_bind_port
            && self.tls == other.tls
            && self.endpoint_set() == other.endpoint_set()
    }
}

impl Eq for Upstream {}

/// Everything the proxy needs to know, at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub service_name: String,
    pub service_id: String,
    pub ca_pool: CaPool,
    pub downstream: Downstream,
    /// Sorted by service name.
    pub upstreams: Vec<Upstream>,
}

impl Snapshot {
    pub fn upstream(&self, service: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.service == service)
    }

    /// Every TLS material the snapshot's listeners reference.
    pub fn tls_materials(&self) -> Vec<&TlsMaterial> {
        std::iter::once(&self.downstream.tls)
            .chain(self.upstreams.iter().map(|u| &u.tls))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, weight: u32) -> UpstreamEndpoint {
        UpstreamEndpoint {
            host: host.to_string(),
            port,
            weight,
        }
    }

    fn upstream(endpoints: Vec<UpstreamEndpoint>) -> Upstream {
        Upstream {
            service: "billing".to_string(),
            local_bind_address: "127.0.0.1".to_string(),
            local_bind_port: 9191,
            tls: TlsMaterial::default(),
            endpoints,
        }
    }

    #[test]
    fn test_upstream_equality_ignores_endpoint_order() {
        let a = upstream(vec![endpoint("10.0.0.1", 80, 1), endpoint("10.0.0.2", 80, 5)]);
        let b = upstream(vec![endpoint("10.0.0.2", 80, 5), endpoint("10.0.0.1", 80, 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_upstream_equality_sees_weight_change() {
        let a = upstream(vec![endpoint("10.0.0.1", 80, 1)]);
        let b = upstream(vec![endpoint("10.0.0.1", 80, 2)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ca_pool_rejects_garbage() {
        let mut pool = CaPool::new();
        assert!(!pool.append_pem(b"not a certificate"));
        assert!(pool.is_empty());
    }
}
