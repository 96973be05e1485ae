//! feedsync - keeps a relational store in line with a remote versioned feed.
//!
//! Starts one sync loop per configured service plus a small status endpoint,
//! and exits non-zero as soon as any loop hits a fatal error so an external
//! supervisor can restart it from the durable cursors.

use feedsync_server::awaiter::{BackendProbe, BackgroundAwaiter};
use feedsync_server::config::{load_services, Config};
use feedsync_server::coordinator::DependencyCoordinator;
use feedsync_server::db::{self, PersistenceBackend, PgBackend};
use feedsync_server::error::SyncError;
use feedsync_server::host::{HostContext, SyncHost};
use feedsync_server::http_source::HttpSource;
use feedsync_server::persister::RetryConfig;
use feedsync_server::state_machine::StateMachine;
use feedsync_server::tracking::ServiceTracker;
use feedsync_server::{build_router, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedsync_server=debug,feedsync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let services = load_services(&config.services_file)?;

    tracing::info!(
        services = services.len(),
        machine = %config.machine_name,
        "Starting feedsync on {}:{}",
        config.host,
        config.port
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url, config.database_max_connections)?;
    let backend: Arc<dyn PersistenceBackend> = Arc::new(PgBackend::new(pool.clone()));
    let tracker = ServiceTracker::new_shared(config.machine_name.clone());

    let source = Arc::new(HttpSource::new(config.source_url.clone())?);
    let state = StateMachine::new_shared();
    let awaiter = Arc::new(BackgroundAwaiter::new(
        state.clone(),
        tracker.clone(),
        Arc::new(BackendProbe::new(backend.clone(), source.clone())),
        config.wait_tick,
        config.connectivity_retry,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown requested");
                    cancel.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "Cannot listen for shutdown signal"),
            }
        });
    }

    // Start status endpoint
    let app = build_router(AppState::new(
        state,
        tracker.clone(),
        config.wait_tick,
        cancel.clone(),
    ));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Status endpoint listening on {}", addr);

    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    // Run migrations and load tracking, waiting out an unreachable database
    tracing::info!("Running database migrations...");
    let startup = async {
        let (pool, backend) = (&pool, &backend);
        awaiter
            .retry_until_connected(
                "migrations",
                move || async move { db::run_migrations(pool).await.map_err(SyncError::from) },
                &cancel,
            )
            .await?;
        let rows = awaiter
            .retry_until_connected(
                "load tracking",
                move || async move { backend.load_tracking().await.map_err(SyncError::from) },
                &cancel,
            )
            .await?;
        tracker.seed(rows);
        Ok::<_, SyncError>(())
    };
    match startup.await {
        Ok(()) => {}
        Err(SyncError::Cancelled) => {
            server.await??;
            tracing::info!("feedsync stopped before starting its loops");
            return Ok(());
        }
        Err(err) => {
            cancel.cancel();
            server.await??;
            return Err(err.into());
        }
    }

    let context = HostContext {
        backend,
        feed_source: source.clone(),
        cache_source: source,
        awaiter,
        coordinator: Arc::new(DependencyCoordinator::new(tracker.clone(), config.wait_tick)),
        retry: RetryConfig::new(config.persist_max_attempts),
    };
    let host = SyncHost::from_descriptors(&context, &services, cancel.clone());

    let result = host.run().await;
    cancel.cancel();
    server.await??;

    if let Err(err) = result {
        tracing::error!(error = %feedsync_server::runner::report(&err), "feedsync stopped on a fatal error");
        return Err(err.into());
    }

    tracing::info!("feedsync stopped");
    Ok(())
}
