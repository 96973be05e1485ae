//! The loop every service runs.
//!
//! ```text
//! initialize ─► gate ─► iteration ─┬─ ok ──────────► (poll wait) ─► gate ...
//!                                  ├─ connectivity ─► Waiting, retry delay
//!                                  ├─ foreign key ──► coordinator wait
//!                                  ├─ cancelled ────► stop
//!                                  └─ fatal ────────► stop with error
//! ```

use crate::awaiter::{sleep_or_cancel, BackgroundAwaiter, GateContext};
use crate::coordinator::DependencyCoordinator;
use crate::error::{Result, SyncError};
use crate::worker::SyncWorker;
use chrono::{DateTime, Utc};
use feedsync_engine::{FailureKind, ServiceDependency};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives one [`SyncWorker`] until shutdown or a fatal error. Never runs two
/// iterations at once.
pub struct ServiceRunner {
    worker: Box<dyn SyncWorker>,
    gate: GateContext,
    dependencies: ServiceDependency,
    awaiter: Arc<BackgroundAwaiter>,
    coordinator: Arc<DependencyCoordinator>,
}

impl ServiceRunner {
    pub fn new(
        worker: Box<dyn SyncWorker>,
        gate: GateContext,
        dependencies: ServiceDependency,
        awaiter: Arc<BackgroundAwaiter>,
        coordinator: Arc<DependencyCoordinator>,
    ) -> Self {
        Self {
            worker,
            gate,
            dependencies,
            awaiter,
            coordinator,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.gate.service_id
    }

    pub fn pause_for_maintenance(&self) -> bool {
        self.gate.pause_for_maintenance
    }

    /// Run until cancelled (`Ok`) or a fatal error (`Err`).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        match self.drive(&cancel).await {
            Ok(()) | Err(SyncError::Cancelled) => {
                tracing::info!(service = %self.service_id(), "Sync loop stopped");
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    service = %self.service_id(),
                    kind = ?err.failure_kind(),
                    error = %report(&err),
                    "Fatal error, stopping sync loop"
                );
                Err(err)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        let state = self.awaiter.state().clone();
        let tracker = self.awaiter.tracker().clone();
        let mut epoch = state.status().recovery_epoch;

        loop {
            self.awaiter.wait_for_connectivity(&mut epoch, cancel).await?;
            let failed_at = Utc::now();
            match self.worker.initialize(cancel).await {
                Ok(()) => break,
                Err(err) => self.handle_failure(err, failed_at, cancel).await?,
            }
        }
        tracker.mark_started(self.service_id());

        loop {
            let restored = self.awaiter.gate(&self.gate, &mut epoch, cancel).await?;

            let failed_at = Utc::now();
            let result = self.worker.run_iteration(restored, cancel).await;
            state.set_busy(self.service_id(), false);

            match result {
                Ok(outcome) if outcome.wait_before_next => {
                    self.awaiter
                        .wait_poll_interval(self.worker.poll_interval(), cancel)
                        .await?;
                }
                Ok(_) => {}
                Err(err) => self.handle_failure(err, failed_at, cancel).await?,
            }
        }
    }

    /// Route a failed iteration. `Ok` means the loop may carry on.
    async fn handle_failure(&self, err: SyncError, failed_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        match err.failure_kind() {
            FailureKind::Cancelled => Err(err),
            FailureKind::Connectivity { reason } => {
                tracing::warn!(service = %self.service_id(), reason = %reason, error = %err, "Connectivity failure");
                self.awaiter.state().enter_waiting(reason);
                sleep_or_cancel(self.awaiter.retry_delay(), cancel).await
            }
            FailureKind::ForeignKey { constraint } => {
                self.coordinator
                    .resolve(
                        self.service_id(),
                        &self.dependencies,
                        constraint.as_deref(),
                        failed_at,
                        cancel,
                    )
                    .await
            }
            FailureKind::Fatal => Err(err),
        }
    }
}

/// An error and all of its sources on one line.
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
