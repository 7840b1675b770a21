//! HTTP trigger surface — the scheduled caller hits these endpoints.
//!
//! Every route is guarded by the shared trigger secret; an unauthorized call
//! is rejected before any work runs. The run endpoint always answers with a
//! well-formed JSON summary — errors are inside the summary, never thrown
//! past this boundary.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::metrics::OutcomeAggregator;
use crate::monitor::ReplyMonitor;

/// Header carrying the shared trigger secret.
pub const TRIGGER_SECRET_HEADER: &str = "x-trigger-secret";

/// Shared state for monitor routes.
#[derive(Clone)]
pub struct MonitorRouteState {
    pub monitor: Arc<ReplyMonitor>,
    pub aggregator: Arc<OutcomeAggregator>,
    pub secret: SecretString,
}

/// Constant-time byte comparison — the secret check must not leak length or
/// prefix information through timing.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();

    let mut diff = presented.len() ^ expected.len();
    for i in 0..expected.len() {
        let p = presented.get(i).copied().unwrap_or(0);
        diff |= (p ^ expected[i]) as usize;
    }
    diff == 0
}

fn authorized(state: &MonitorRouteState, headers: &HeaderMap) -> bool {
    headers
        .get(TRIGGER_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| secrets_match(presented, state.secret.expose_secret()))
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
        .into_response()
}

/// POST /api/monitor/run
///
/// Execute one monitor pass and return its summary.
async fn run_monitor(
    State(state): State<MonitorRouteState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let summary = state.monitor.run_once().await;
    Json(summary).into_response()
}

/// POST /api/monitor/sweep
///
/// Execute one staleness sweep pass.
async fn run_sweep(
    State(state): State<MonitorRouteState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.monitor.sweep_stale().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct OutcomeQuery {
    /// Window length in days, counted back from now.
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

/// GET /api/metrics/outcomes?days=30
///
/// Read-side outcome metrics over the window.
async fn outcome_metrics(
    State(state): State<MonitorRouteState>,
    headers: HeaderMap,
    Query(query): Query<OutcomeQuery>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let end = Utc::now();
    let start = end - chrono::Duration::days(query.days.clamp(1, 365));
    match state.aggregator.report(start, end).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Build the monitor trigger and metrics routes.
pub fn monitor_routes(state: MonitorRouteState) -> Router {
    Router::new()
        .route("/api/monitor/run", post(run_monitor))
        .route("/api/monitor/sweep", post(run_sweep))
        .route("/api/metrics/outcomes", get(outcome_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
