use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::reconciler::ReconcileStatus;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub version: &'static str,
    pub status: &'static str,
}

pub async fn get_health(State(state): State<AdminState>) -> (StatusCode, Json<HealthStatus>) {
    let ready = state.status.load().ready;
    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    (
        code,
        Json(HealthStatus {
            version: env!("CARGO_PKG_VERSION"),
            status,
        }),
    )
}

pub async fn get_status(State(state): State<AdminState>) -> Json<ReconcileStatus> {
    Json(ReconcileStatus::clone(&state.status.load()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::StatusHandle;

    #[tokio::test]
    async fn test_health_reflects_readiness() {
        let status = StatusHandle::new();
        let state = AdminState::new(status.clone(), None);

        let (code, Json(body)) = get_health(State(state.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "starting");

        status.failed("dataplane unreachable");
        let Json(current) = get_status(State(state)).await;
        assert!(!current.ready);
        assert_eq!(current.last_error.as_deref(), Some("dataplane unreachable"));
    }
}
