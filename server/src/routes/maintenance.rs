//! Maintenance window control.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;

/// State of the maintenance window after a request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceResponse {
    pub maintenance: bool,
    /// No loop that pauses for maintenance is inside an iteration
    pub quiescent: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/maintenance", post(begin).delete(end))
}

/// POST /maintenance - open a window and answer once every loop registered
/// for maintenance has parked. Answers 503 if the process shuts down first.
async fn begin(State(state): State<AppState>) -> (StatusCode, Json<MaintenanceResponse>) {
    state.state.begin_maintenance();
    let code = match state
        .state
        .wait_for_quiescence(state.wait_tick, &state.shutdown)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(MaintenanceResponse {
            maintenance: true,
            quiescent: state.state.is_quiescent(),
        }),
    )
}

/// DELETE /maintenance - close the window and release parked loops.
async fn end(State(state): State<AppState>) -> Json<MaintenanceResponse> {
    state.state.end_maintenance();
    Json(MaintenanceResponse {
        maintenance: false,
        quiescent: state.state.is_quiescent(),
    })
}
