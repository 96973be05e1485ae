//! HTTP route definitions.

mod health;
mod maintenance;
mod status;

pub use health::HealthResponse;
pub use maintenance::MaintenanceResponse;
pub use status::{ServiceStatus, StatusResponse};

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(maintenance::routes())
        .merge(status::routes())
}
