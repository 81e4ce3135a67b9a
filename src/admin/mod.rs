//! Admin HTTP endpoints.
//!
//! - `GET /health`: 200 once a snapshot has been applied, 503 before
//! - `GET /status`: what the reconciler last committed (bearer token when configured)

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::reconciler::StatusHandle;
use self::auth::admin_auth_middleware;
use self::handlers::{get_health, get_status};

#[derive(Clone)]
pub struct AdminState {
    pub status: StatusHandle,
    pub api_key: Option<Arc<str>>,
}

impl AdminState {
    pub fn new(status: StatusHandle, api_key: Option<String>) -> Self {
        Self {
            status,
            api_key: api_key.map(Arc::from),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/status", get(get_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(get_health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Admin endpoint listening");
    }
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
