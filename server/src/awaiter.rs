//! Wait gate run at the top of every loop iteration.
//!
//! The gate holds a loop, in order, until its prerequisite services have
//! started, any maintenance window is over and connectivity is back. Every
//! wait wakes on the relevant notification or on a short tick, whichever
//! comes first, and returns [`SyncError::Cancelled`] on shutdown.

use crate::db::PersistenceBackend;
use crate::error::{Result, SyncError};
use crate::source::HealthCheck;
use crate::state_machine::StateMachine;
use crate::tracking::ServiceTracker;
use async_trait::async_trait;
use feedsync_engine::{FailureKind, ServiceId, WaitReason};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Checks whether the resource behind a wait reason is reachable again.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, reason: WaitReason) -> bool;
}

/// Probe that pings the database or the source health endpoint.
pub struct BackendProbe {
    backend: Arc<dyn PersistenceBackend>,
    source: Arc<dyn HealthCheck>,
}

impl BackendProbe {
    pub fn new(backend: Arc<dyn PersistenceBackend>, source: Arc<dyn HealthCheck>) -> Self {
        Self { backend, source }
    }
}

#[async_trait]
impl ConnectivityProbe for BackendProbe {
    async fn probe(&self, reason: WaitReason) -> bool {
        let result = match reason {
            WaitReason::DatabaseUnavailable => self.backend.ping().await.map_err(|e| e.to_string()),
            WaitReason::SourceUnavailable => self.source.health().await.map_err(|e| e.to_string()),
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(reason = %reason, error = %error, "Connectivity probe failed");
                false
            }
        }
    }
}

/// What the gate needs to know about the loop it is holding.
#[derive(Debug, Clone, Default)]
pub struct GateContext {
    pub service_id: ServiceId,
    pub prerequisites: Vec<ServiceId>,
    pub pause_for_maintenance: bool,
}

/// Composable waits shared by every loop.
pub struct BackgroundAwaiter {
    state: Arc<StateMachine>,
    tracker: Arc<ServiceTracker>,
    probe: Arc<dyn ConnectivityProbe>,
    tick: Duration,
    retry_delay: Duration,
}

impl BackgroundAwaiter {
    pub fn new(
        state: Arc<StateMachine>,
        tracker: Arc<ServiceTracker>,
        probe: Arc<dyn ConnectivityProbe>,
        tick: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            state,
            tracker,
            probe,
            tick,
            retry_delay,
        }
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn tracker(&self) -> &Arc<ServiceTracker> {
        &self.tracker
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Run the gate's waits in order, then claim the next iteration.
    ///
    /// `last_epoch` is the recovery epoch the loop saw at its previous gate.
    /// Returns true if connectivity was restored since then, in which case
    /// the loop must roll its cursor back before fetching. On return the loop
    /// is marked busy; the caller clears it when the iteration ends. A window
    /// opened while the loop waited for connectivity sends it back through
    /// the waits.
    pub async fn gate(
        &self,
        ctx: &GateContext,
        last_epoch: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut restored = false;
        loop {
            self.wait_for_prerequisites(ctx, cancel).await?;
            self.wait_for_maintenance(ctx, cancel).await?;
            restored |= self.wait_for_connectivity(last_epoch, cancel).await?;
            if self.state.claim_iteration(&ctx.service_id, ctx.pause_for_maintenance) {
                return Ok(restored);
            }
        }
    }

    /// Run `op` once the process is connected, retrying it for as long as it
    /// fails on connectivity. Other failures are returned as they are.
    pub async fn retry_until_connected<T, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut epoch = self.state.status().recovery_epoch;
        loop {
            self.wait_for_connectivity(&mut epoch, cancel).await?;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let FailureKind::Connectivity { reason } = err.failure_kind() else {
                return Err(err);
            };
            tracing::warn!(operation = %what, reason = %reason, error = %err, "Connectivity failure");
            self.state.enter_waiting(reason);
            sleep_or_cancel(self.retry_delay, cancel).await?;
        }
    }

    /// Hold until every prerequisite has started in this process.
    pub async fn wait_for_prerequisites(&self, ctx: &GateContext, cancel: &CancellationToken) -> Result<()> {
        let mut logged = false;
        loop {
            let progressed = self.tracker.progressed();
            let pending: Vec<&ServiceId> = ctx
                .prerequisites
                .iter()
                .filter(|p| !self.tracker.has_started(p))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if !logged {
                tracing::info!(service = %ctx.service_id, waiting_for = ?pending, "Waiting for prerequisite services");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = progressed => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
    }

    /// Park while a maintenance window is open. Loops that are not
    /// registered for maintenance pass straight through.
    pub async fn wait_for_maintenance(&self, ctx: &GateContext, cancel: &CancellationToken) -> Result<()> {
        if !ctx.pause_for_maintenance {
            return Ok(());
        }
        let mut status = self.state.subscribe();
        if !status.borrow_and_update().maintenance {
            return Ok(());
        }

        tracing::info!(service = %ctx.service_id, "Paused for maintenance");
        self.state.set_paused(&ctx.service_id, true);
        let result = loop {
            if !status.borrow_and_update().maintenance {
                break Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => break Err(SyncError::Cancelled),
                _ = status.changed() => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        };
        self.state.set_paused(&ctx.service_id, false);
        if result.is_ok() {
            tracing::info!(service = %ctx.service_id, "Resumed after maintenance");
        }
        result
    }

    /// Hold while the process is Waiting, probing every retry delay.
    ///
    /// Returns true if the recovery epoch moved past `last_epoch`, whether
    /// this loop ran the successful probe or another one did.
    pub async fn wait_for_connectivity(&self, last_epoch: &mut u64, cancel: &CancellationToken) -> Result<bool> {
        let mut status = self.state.subscribe();
        loop {
            let current = *status.borrow_and_update();
            let Some(reason) = current.state.wait_reason() else {
                let restored = current.recovery_epoch > *last_epoch;
                *last_epoch = current.recovery_epoch;
                return Ok(restored);
            };

            if self.probe.probe(reason).await {
                self.state.restore();
                continue;
            }

            let deadline = tokio::time::Instant::now() + self.retry_delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    changed = status.changed() => {
                        if changed.is_err() || status.borrow().state.wait_reason().is_none() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = tokio::time::sleep(self.tick) => {}
                }
            }
        }
    }

    /// Sleep one poll interval after an iteration that found nothing new.
    pub async fn wait_poll_interval(&self, interval: Duration, cancel: &CancellationToken) -> Result<()> {
        sleep_or_cancel(interval, cancel).await
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
