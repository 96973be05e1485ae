//! Foreign-key dependency coordination.
//!
//! When a batch fails because it references a parent row another loop has
//! not committed yet, the consumer looks the violated constraint up in its
//! dependency map and waits for the producing service to make progress past
//! the moment of failure. The batch itself is never dropped: the consumer's
//! cursor did not advance, so the next iteration fetches it again.

use crate::error::{Result, SyncError};
use crate::tracking::ServiceTracker;
use chrono::{DateTime, Utc};
use feedsync_engine::{DependencyResolution, ServiceDependency};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Resolves foreign-key violations through producer progress.
pub struct DependencyCoordinator {
    tracker: Arc<ServiceTracker>,
    tick: Duration,
}

impl DependencyCoordinator {
    pub fn new(tracker: Arc<ServiceTracker>, tick: Duration) -> Self {
        Self { tracker, tick }
    }

    /// Handle a violation of `constraint` raised at `failed_at`.
    ///
    /// Returns once the producing service has recorded progress after
    /// `failed_at`. An unmapped or unnamed constraint cannot resolve itself
    /// and is returned as a fatal error.
    pub async fn resolve(
        &self,
        consumer: &str,
        dependencies: &ServiceDependency,
        constraint: Option<&str>,
        failed_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (constraint, producer) = match dependencies.resolve(constraint) {
            DependencyResolution::WaitFor { constraint, producer } => (constraint, producer),
            DependencyResolution::Unmapped { constraint } => {
                return Err(SyncError::Fatal(match constraint {
                    Some(name) => format!(
                        "{} violated foreign key {} which has no producing service",
                        consumer, name
                    ),
                    None => format!(
                        "{} hit a foreign key violation without a constraint name",
                        consumer
                    ),
                }));
            }
        };

        tracing::info!(
            service = %consumer,
            constraint = %constraint,
            producer = %producer,
            "Foreign key violation, waiting for producing service"
        );

        loop {
            let progressed = self.tracker.progressed();
            if self
                .tracker
                .progress_of(&producer)
                .is_some_and(|at| at > failed_at)
            {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = progressed => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        }

        tracing::info!(service = %consumer, producer = %producer, "Producing service caught up, retrying");
        Ok(())
    }
}
