//! feedsync server: keeps a relational store in line with a remote,
//! versioned feed.
//!
//! Every entity type runs as an independent loop ([`runner::ServiceRunner`])
//! built from a plain-data [`config::ServiceDescriptor`]. Loops share two
//! pieces of state: the connectivity [`state_machine::StateMachine`] and the
//! per-service [`tracking::ServiceTracker`]. Ordering between loops is never
//! enforced by locks; a loop that hits a foreign-key violation waits for the
//! producing loop through the [`coordinator::DependencyCoordinator`].

pub mod awaiter;
pub mod cache_engine;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod feed_engine;
pub mod host;
pub mod http_source;
pub mod persister;
pub mod routes;
pub mod runner;
pub mod source;
pub mod state_machine;
pub mod tracking;
pub mod worker;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state_machine::StateMachine;
use crate::tracking::ServiceTracker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateMachine>,
    pub tracker: Arc<ServiceTracker>,
    /// Re-check interval for handlers that wait on the loops
    pub wait_tick: Duration,
    /// Cancelled on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        state: Arc<StateMachine>,
        tracker: Arc<ServiceTracker>,
        wait_tick: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            tracker,
            wait_tick,
            shutdown,
        }
    }
}

/// Build the status router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
