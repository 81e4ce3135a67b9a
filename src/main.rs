//! mesh-sidecar
//!
//! Keeps a local HAProxy in line with what the service mesh says this
//! service should look like.
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌───────────────┐  blocking queries  ┌──────────────┐
//!   │ consul agent  │◀───────────────────│   watcher    │
//!   └───────────────┘                    │ (4 tracks +  │
//!                                        │  upstreams)  │
//!                                        └──────┬───────┘
//!                                               │ Snapshot (capacity 1)
//!                                               ▼
//!   ┌───────────────┐   transactions     ┌──────────────┐     ┌─────────┐
//!   │ dataplane API │◀───────────────────│  reconciler  │────▶│  admin  │
//!   └───────────────┘                    └──────────────┘     │ /health │
//!                                                             │ /status │
//!                                                             └─────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mesh_sidecar::admin::{self, AdminState};
use mesh_sidecar::config::loader::{load_config, validated};
use mesh_sidecar::config::SidecarConfig;
use mesh_sidecar::dataplane::{DataplaneClient, HttpTransport, MemoryStore, Transport};
use mesh_sidecar::lifecycle::shutdown::DRAIN_TIMEOUT;
use mesh_sidecar::lifecycle::{signals, Shutdown};
use mesh_sidecar::mesh::ConsulClient;
use mesh_sidecar::observability::{logging, metrics};
use mesh_sidecar::reconciler::{FileCertStore, Reconciler, ReconcilerOptions, StatusHandle};
use mesh_sidecar::watcher::Watcher;

/// Delay between data plane reachability probes at startup.
const PING_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "mesh-sidecar")]
#[command(about = "Service mesh sidecar driving HAProxy through its Data Plane API", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service id to act as sidecar for (overrides `service_id`).
    #[arg(long)]
    sidecar_for: Option<String>,

    /// Log level or filter directive (overrides `observability.log_level`).
    #[arg(long)]
    log_level: Option<String>,

    /// Apply configuration to an in-memory store instead of the proxy.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(service_id) = cli.sidecar_for {
        config.service_id = service_id;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    let config = validated(config)?;

    logging::init(Some(&config.observability.log_level));
    tracing::info!("mesh-sidecar v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        service_id = %config.service_id,
        consul = %config.consul.address,
        dataplane = %config.dataplane.address,
        intentions = config.haproxy.enable_intentions,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    signals::spawn_handler(shutdown.clone());

    if cli.dry_run {
        tracing::warn!("Dry run: proxy configuration is applied to an in-memory store");
        run(config, MemoryStore::new(1), shutdown).await?;
    } else {
        let transport = HttpTransport::new(
            &config.dataplane.address,
            &config.dataplane.username,
            &config.dataplane.password,
            Duration::from_secs(config.dataplane.request_timeout_secs),
        )?;
        run(config, transport, shutdown).await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run<T: Transport>(
    config: SidecarConfig,
    transport: T,
    shutdown: Shutdown,
) -> Result<(), Box<dyn std::error::Error>> {
    let dataplane = DataplaneClient::new(transport, 0);
    if !wait_for_dataplane(&dataplane, &shutdown).await {
        return Ok(());
    }
    let version = dataplane.refresh_version().await?;
    tracing::info!(version, "Dataplane reachable");

    let consul = ConsulClient::new(&config.consul.address, config.consul.token.clone())?;

    let cert_dir = if config.haproxy.cert_dir.is_empty() {
        std::env::temp_dir().join("mesh-sidecar-certs")
    } else {
        PathBuf::from(&config.haproxy.cert_dir)
    };
    let certs = FileCertStore::new(&cert_dir)?;
    tracing::info!(cert_dir = ?cert_dir, "Certificate store ready");

    let status = StatusHandle::new();
    let options = ReconcilerOptions {
        enable_intentions: config.haproxy.enable_intentions,
        spoe_config: config.haproxy.spoe_config.clone(),
        log_socket: config.haproxy.log_socket.clone(),
    };
    let reconciler = Reconciler::new(dataplane, certs, options).with_status(status.clone());

    let (snapshots_tx, snapshots_rx) = mpsc::channel(1);
    let mut tasks = vec![tokio::spawn(reconciler.run(snapshots_rx, shutdown.subscribe()))];

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(status, config.admin.api_key.clone());
        let token = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, token).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
    }

    let watcher = Watcher::new(config.service_id.clone(), consul, snapshots_tx, shutdown.subscribe());
    let result = watcher.run().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Watcher failed");
    }

    shutdown.trigger();
    Shutdown::drain(tasks, DRAIN_TIMEOUT).await;
    result.map_err(Into::into)
}

/// Probe the data plane until it answers. False if shutdown came first.
async fn wait_for_dataplane<T: Transport>(client: &DataplaneClient<T>, shutdown: &Shutdown) -> bool {
    loop {
        match client.ping().await {
            Ok(()) => return true,
            Err(e) => tracing::warn!(error = %e, "Dataplane not reachable yet"),
        }
        tokio::select! {
            _ = shutdown.triggered() => return false,
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }
    }
}
