//! Read-only view of the sync loops.

use axum::{extract::State, routing::get, Json, Router};
use feedsync_engine::{ProcessStatus, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::state_machine::ServiceRegistration;
use crate::tracking::ServiceTracking;
use crate::AppState;

/// One loop as seen from outside.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service_id: ServiceId,
    pub pause_for_maintenance: bool,
    pub paused: bool,
    pub busy: bool,
    pub started: bool,
    pub tracking: Option<ServiceTracking>,
}

/// `GET /status` response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub process: ProcessStatus,
    pub services: Vec<ServiceStatus>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut tracking: BTreeMap<ServiceId, ServiceTracking> = state
        .tracker
        .all()
        .into_iter()
        .map(|row| (row.service_id.clone(), row))
        .collect();

    let services = state
        .state
        .services()
        .into_iter()
        .map(|(service_id, registration): (ServiceId, ServiceRegistration)| ServiceStatus {
            started: state.tracker.has_started(&service_id),
            tracking: tracking.remove(&service_id),
            pause_for_maintenance: registration.pause_for_maintenance,
            paused: registration.paused,
            busy: registration.busy,
            service_id,
        })
        .collect();

    Json(StatusResponse {
        process: state.state.status(),
        services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;
    use crate::tracking::ServiceTracker;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::DateTime;
    use feedsync_engine::WaitReason;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_status_reports_state_and_services() {
        let machine = StateMachine::new_shared();
        let tracker = ServiceTracker::new_shared("sync-01");
        machine.register("DeviceService", true);
        machine.register("LogRecordService", false);
        tracker.mark_started("DeviceService");
        tracker.record_iteration("DeviceService", DateTime::from_timestamp(10, 0).unwrap());
        machine.enter_waiting(WaitReason::DatabaseUnavailable);

        let app = crate::routes::create_routes().with_state(AppState::new(
            machine,
            tracker,
            Duration::from_millis(5),
            CancellationToken::new(),
        ));
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["state"]["state"], "waiting");
        assert_eq!(json["state"]["reason"], "databaseUnavailable");
        assert_eq!(json["recoveryEpoch"], 0);
        assert_eq!(json["services"][0]["serviceId"], "DeviceService");
        assert_eq!(json["services"][0]["started"], true);
        assert_eq!(json["services"][0]["tracking"]["machineName"], "sync-01");
        assert!(json["services"][1]["tracking"].is_null());
    }

    #[tokio::test]
    async fn test_health_follows_connectivity() {
        let machine = StateMachine::new_shared();
        let app = crate::routes::create_routes().with_state(AppState::new(
            machine.clone(),
            ServiceTracker::new_shared("sync-01"),
            Duration::from_millis(5),
            CancellationToken::new(),
        ));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: crate::routes::HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.waiting_for, None);

        machine.enter_waiting(WaitReason::SourceUnavailable);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: crate::routes::HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "waiting");
        assert_eq!(health.waiting_for, Some(WaitReason::SourceUnavailable));
    }
}
