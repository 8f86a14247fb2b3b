//! # Health Check Handlers
//!
//! Both endpoints return the per-service boolean map. The process counts as live only
//! when every registered predicate is true.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::collections::BTreeMap;
use tracing::debug;

use crate::web::state::AppState;

/// Liveness probe: GET /_health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<BTreeMap<String, bool>>) {
    report(&state).await
}

/// Readiness probe: GET /_ready
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<BTreeMap<String, bool>>) {
    report(&state).await
}

async fn report(state: &AppState) -> (StatusCode, Json<BTreeMap<String, bool>>) {
    let checks = state.health.check_all().await;
    let status = if checks.values().all(|healthy| *healthy) {
        StatusCode::OK
    } else {
        debug!(checks = ?checks, "Health check failing");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(checks))
}
