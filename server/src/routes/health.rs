//! Liveness endpoint.
//!
//! Answers 503 while the process is Waiting so a supervisor can tell a
//! stalled sync from a healthy one without parsing `/status`.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use feedsync_engine::WaitReason;
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` or `waiting`
    pub status: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<WaitReason>,
    pub maintenance: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.state.status();
    let waiting_for = status.state.wait_reason();
    let code = match waiting_for {
        Some(_) => StatusCode::SERVICE_UNAVAILABLE,
        None => StatusCode::OK,
    };

    (
        code,
        Json(HealthResponse {
            status: if waiting_for.is_some() { "waiting" } else { "ok" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            waiting_for,
            maintenance: status.maintenance,
        }),
    )
}

async fn root() -> &'static str {
    "feedsync"
}
