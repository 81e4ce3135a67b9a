//! Health-aware endpoint selection.
//!
//! # Responsibilities
//! - Aggregate the check results of one service instance
//! - Map the aggregate to the instance's configured weight
//! - Drop instances that should receive no traffic

use crate::mesh::types::{HealthCheck, ServiceEntry};
use crate::snapshot::UpstreamEndpoint;

/// Aggregated health of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    fn from_check(status: &str) -> Self {
        match status {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            "maintenance" => HealthStatus::Maintenance,
            // unknown statuses count as critical
            _ => HealthStatus::Critical,
        }
    }

    fn severity(self) -> u8 {
        match self {
            HealthStatus::Passing => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Maintenance => 3,
        }
    }
}

/// Worst status across all checks; an instance without checks is passing.
pub fn aggregated_status(checks: &[HealthCheck]) -> HealthStatus {
    checks
        .iter()
        .map(|c| HealthStatus::from_check(&c.status))
        .max_by_key(|s| s.severity())
        .unwrap_or(HealthStatus::Passing)
}

/// Weight for an instance, or `None` if it must not receive traffic.
pub fn endpoint_for(entry: &ServiceEntry) -> Option<UpstreamEndpoint> {
    let weight = match aggregated_status(&entry.checks) {
        HealthStatus::Passing => entry.service.weights.passing,
        HealthStatus::Warning => entry.service.weights.warning,
        HealthStatus::Critical | HealthStatus::Maintenance => return None,
    };
    if weight == 0 {
        return None;
    }

    let host = if entry.service.address.is_empty() {
        entry.node.address.clone()
    } else {
        entry.service.address.clone()
    };

    Some(UpstreamEndpoint {
        host,
        port: entry.service.port,
        weight,
    })
}

/// Weighted endpoints of all instances that may receive traffic, sorted.
pub fn select_endpoints(entries: &[ServiceEntry]) -> Vec<UpstreamEndpoint> {
    let mut endpoints: Vec<_> = entries.iter().filter_map(endpoint_for).collect();
    endpoints.sort();
    endpoints
}
