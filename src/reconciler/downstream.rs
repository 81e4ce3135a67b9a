//! Inbound (mesh-facing) listener objects.

use crate::dataplane::models::{
    Backend, Bind, Filter, FilterType, Frontend, Mode, RuleCond, Server, TcpRequestRule,
    TcpRuleAction, TcpRuleType,
};
use crate::dataplane::{ParentType, Transaction, Transport};
use crate::reconciler::certs::CertStore;
use crate::reconciler::{log_target, Existing, ReconcileError, ReconcilerOptions, DEFAULT_TIMEOUT_MS};
use crate::snapshot::Downstream;

pub const FRONTEND_NAME: &str = "front_downstream";
pub const BACKEND_NAME: &str = "back_downstream";
pub const SERVER_NAME: &str = "downstream_node";

const SPOE_ENGINE: &str = "intentions";
const AUTHORIZED_COND: &str = "{ var(sess.connect.auth) -m int eq 1 }";

/// Remove whatever exists of the inbound listener and its backend.
pub async fn teardown<T: Transport>(tx: &Transaction<'_, T>, existing: Existing) -> Result<(), ReconcileError> {
    if existing.frontend {
        tx.delete_frontend(FRONTEND_NAME).await?;
    }
    if existing.backend {
        tx.delete_backend(BACKEND_NAME).await?;
    }
    Ok(())
}

/// Create the inbound listener: mutual TLS termination, then forward to the
/// local application.
pub async fn build<T: Transport>(
    tx: &Transaction<'_, T>,
    ds: &Downstream,
    certs: &dyn CertStore,
    opts: &ReconcilerOptions,
) -> Result<(), ReconcileError> {
    tx.create_frontend(&Frontend {
        name: FRONTEND_NAME.to_string(),
        default_backend: Some(BACKEND_NAME.to_string()),
        client_timeout: Some(DEFAULT_TIMEOUT_MS),
        mode: Some(Mode::Http),
        httplog: true,
    })
    .await?;

    let paths = certs.certs_path(&ds.tls)?;

    tx.create_bind(
        FRONTEND_NAME,
        &Bind {
            name: format!("{}_bind", FRONTEND_NAME),
            address: ds.local_bind_address.clone(),
            port: Some(ds.local_bind_port),
            ssl: true,
            ssl_certificate: Some(paths.certificate_str()),
            ssl_cafile: Some(paths.ca_file_str()),
            verify: None,
        },
    )
    .await?;

    tx.create_log_target(ParentType::Frontend, FRONTEND_NAME, &log_target(opts))
        .await?;

    if opts.enable_intentions {
        tx.create_filter(
            ParentType::Frontend,
            FRONTEND_NAME,
            &Filter {
                id: 0,
                filter_type: FilterType::Spoe,
                spoe_engine: SPOE_ENGINE.to_string(),
                spoe_config: opts.spoe_config.clone(),
            },
        )
        .await?;
        tx.create_tcp_request_rule(
            ParentType::Frontend,
            FRONTEND_NAME,
            &TcpRequestRule {
                id: 0,
                rule_type: TcpRuleType::Content,
                action: TcpRuleAction::Accept,
                cond: RuleCond::If,
                cond_test: AUTHORIZED_COND.to_string(),
            },
        )
        .await?;
    }

    tx.create_backend(&Backend {
        name: BACKEND_NAME.to_string(),
        mode: Some(Mode::Http),
        server_timeout: Some(DEFAULT_TIMEOUT_MS),
        connect_timeout: Some(DEFAULT_TIMEOUT_MS),
        balance: None,
    })
    .await?;

    tx.create_log_target(ParentType::Backend, BACKEND_NAME, &log_target(opts))
        .await?;

    tx.create_server(
        BACKEND_NAME,
        &Server {
            name: SERVER_NAME.to_string(),
            address: ds.target_address.clone(),
            port: Some(ds.target_port),
            ..Default::default()
        },
    )
    .await?;

    Ok(())
}
