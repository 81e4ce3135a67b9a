//! Per-upstream listener objects.
//!
//! Each upstream gets its own frontend (plain, on the local bind address)
//! and backend (one TLS server per healthy endpoint), named after the
//! upstream service so that upstreams never touch each other's objects.

use crate::dataplane::models::{Backend, Balance, Bind, Frontend, Mode, Server, Toggle, Verify};
use crate::dataplane::{ParentType, Transaction, Transport};
use crate::reconciler::certs::CertStore;
use crate::reconciler::{log_target, Existing, ReconcileError, ReconcilerOptions, DEFAULT_TIMEOUT_MS};
use crate::snapshot::Upstream;

/// Bind address used when the upstream declares none.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

pub const FRONTEND_PREFIX: &str = "front_upstream_";
pub const BACKEND_PREFIX: &str = "back_upstream_";

pub fn frontend_name(service: &str) -> String {
    format!("{}{}", FRONTEND_PREFIX, service)
}

pub fn backend_name(service: &str) -> String {
    format!("{}{}", BACKEND_PREFIX, service)
}

pub async fn teardown<T: Transport>(
    tx: &Transaction<'_, T>,
    service: &str,
    existing: Existing,
) -> Result<(), ReconcileError> {
    if existing.frontend {
        tx.delete_frontend(&frontend_name(service)).await?;
    }
    if existing.backend {
        tx.delete_backend(&backend_name(service)).await?;
    }
    Ok(())
}

pub async fn build<T: Transport>(
    tx: &Transaction<'_, T>,
    up: &Upstream,
    certs: &dyn CertStore,
    opts: &ReconcilerOptions,
) -> Result<(), ReconcileError> {
    let fe_name = frontend_name(&up.service);
    let be_name = backend_name(&up.service);

    tx.create_frontend(&Frontend {
        name: fe_name.clone(),
        default_backend: Some(be_name.clone()),
        client_timeout: Some(DEFAULT_TIMEOUT_MS),
        mode: Some(Mode::Http),
        httplog: true,
    })
    .await?;

    let address = if up.local_bind_address.is_empty() {
        DEFAULT_BIND_ADDRESS.to_string()
    } else {
        up.local_bind_address.clone()
    };
    tx.create_bind(
        &fe_name,
        &Bind {
            name: format!("{}_bind", fe_name),
            address,
            port: Some(up.local_bind_port),
            ..Default::default()
        },
    )
    .await?;

    tx.create_log_target(ParentType::Frontend, &fe_name, &log_target(opts))
        .await?;

    tx.create_backend(&Backend {
        name: be_name.clone(),
        mode: Some(Mode::Http),
        server_timeout: Some(DEFAULT_TIMEOUT_MS),
        connect_timeout: Some(DEFAULT_TIMEOUT_MS),
        balance: Some(Balance {
            algorithm: "roundrobin".to_string(),
        }),
    })
    .await?;

    tx.create_log_target(ParentType::Backend, &be_name, &log_target(opts))
        .await?;

    if up.endpoints.is_empty() {
        tracing::warn!(upstream = %up.service, "Upstream has no healthy endpoints");
        return Ok(());
    }

    let paths = certs.certs_path(&up.tls)?;
    for (i, endpoint) in up.endpoints.iter().enumerate() {
        tx.create_server(
            &be_name,
            &Server {
                name: format!("{}_{}", up.service, i),
                address: endpoint.host.clone(),
                port: Some(endpoint.port),
                weight: Some(endpoint.weight),
                ssl: Some(Toggle::Enabled),
                ssl_certificate: Some(paths.certificate_str()),
                ssl_cafile: Some(paths.ca_file_str()),
                verify: Some(Verify::Required),
            },
        )
        .await?;
    }

    Ok(())
}
