//! Hosting every sync loop in one process.

use crate::awaiter::{BackgroundAwaiter, GateContext};
use crate::cache_engine::{CacheSettings, ReferenceCacheEngine};
use crate::config::{ServiceDescriptor, SyncMode};
use crate::coordinator::DependencyCoordinator;
use crate::db::PersistenceBackend;
use crate::error::{Result, SyncError};
use crate::feed_engine::FeedCursorEngine;
use crate::persister::{EntityPersister, RetryConfig};
use crate::runner::ServiceRunner;
use crate::source::{CacheSource, FeedSource};
use crate::worker::{CacheWorker, FeedWorker, SyncWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared collaborators every loop is built from.
#[derive(Clone)]
pub struct HostContext {
    pub backend: Arc<dyn PersistenceBackend>,
    pub feed_source: Arc<dyn FeedSource>,
    pub cache_source: Arc<dyn CacheSource>,
    pub awaiter: Arc<BackgroundAwaiter>,
    pub coordinator: Arc<DependencyCoordinator>,
    pub retry: RetryConfig,
}

impl HostContext {
    /// Build the runner for one service descriptor.
    pub fn runner(&self, descriptor: &ServiceDescriptor) -> ServiceRunner {
        let tracker = self.awaiter.tracker().clone();
        let persister = EntityPersister::new(self.backend.clone(), descriptor.persistence.clone(), self.retry);

        let worker: Box<dyn SyncWorker> = match &descriptor.mode {
            SyncMode::Feed(feed) => Box::new(FeedWorker::new(
                FeedCursorEngine::new(
                    descriptor.service_id.clone(),
                    descriptor.entity_type.clone(),
                    self.feed_source.clone(),
                ),
                persister,
                tracker,
                Duration::from_secs(feed.poll_interval_secs),
                feed.page_limit,
                descriptor.key_column(),
            )
            .with_sink_page_limit(feed.sink_page_limit)),
            SyncMode::Cache(cache) => Box::new(CacheWorker::new(
                descriptor.service_id.clone(),
                ReferenceCacheEngine::new(
                    descriptor.service_id.clone(),
                    descriptor.entity_type.clone(),
                    self.cache_source.clone(),
                ),
                persister,
                tracker,
                CacheSettings {
                    daily_refresh_reference_time: cache.daily_refresh_reference_time,
                    update_interval_minutes: cache.update_interval_minutes,
                    refresh_interval_minutes: cache.refresh_interval_minutes,
                    page_limit: cache.page_limit,
                    fetch_all_pages: cache.fetch_all_pages,
                    key_column: cache.key_column.to_string(),
                },
                cache.table.clone(),
                cache.key_column.clone(),
            )),
        };

        ServiceRunner::new(
            worker,
            GateContext {
                service_id: descriptor.service_id.clone(),
                prerequisites: descriptor.prerequisites.clone(),
                pause_for_maintenance: descriptor.pause_for_maintenance,
            },
            descriptor.dependencies.clone(),
            self.awaiter.clone(),
            self.coordinator.clone(),
        )
    }
}

/// Runs a set of [`ServiceRunner`]s concurrently and stops them all on the
/// first fatal error.
pub struct SyncHost {
    awaiter: Arc<BackgroundAwaiter>,
    runners: Vec<ServiceRunner>,
    cancel: CancellationToken,
}

impl SyncHost {
    pub fn new(awaiter: Arc<BackgroundAwaiter>, cancel: CancellationToken) -> Self {
        Self {
            awaiter,
            runners: Vec::new(),
            cancel,
        }
    }

    /// Build a host with one runner per descriptor.
    pub fn from_descriptors(context: &HostContext, descriptors: &[ServiceDescriptor], cancel: CancellationToken) -> Self {
        let mut host = Self::new(context.awaiter.clone(), cancel);
        for descriptor in descriptors {
            host.add(context.runner(descriptor));
        }
        host
    }

    pub fn add(&mut self, runner: ServiceRunner) {
        self.runners.push(runner);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every loop until shutdown. Returns the first fatal error, after
    /// every other loop has stopped.
    pub async fn run(self) -> Result<()> {
        let state = self.awaiter.state().clone();
        let mut loops = JoinSet::new();

        for runner in self.runners {
            state.register(runner.service_id(), runner.pause_for_maintenance());
            loops.spawn(runner.run(self.cancel.clone()));
        }
        tracing::info!(services = loops.len(), "Sync loops started");

        let mut fatal: Option<SyncError> = None;
        while let Some(joined) = loops.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join) => SyncError::Fatal(format!("sync loop panicked: {}", join)),
            };
            if fatal.is_none() {
                tracing::error!(error = %err, "Stopping every sync loop");
                self.cancel.cancel();
                fatal = Some(err);
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
