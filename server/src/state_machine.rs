//! Process-wide connectivity state.
//!
//! The status lives in a `watch` channel: writers use `send_if_modified` so
//! only real transitions wake readers, and every loop can await changes
//! instead of polling. Service registrations live beside it in a `DashMap`.

use crate::error::{Result, SyncError};
use dashmap::DashMap;
use feedsync_engine::{ProcessStatus, ServiceId, WaitReason};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// How a loop is registered and what it is currently doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// The loop parks at the awaiter during maintenance windows
    pub pause_for_maintenance: bool,
    /// Parked at the maintenance gate
    pub paused: bool,
    /// Inside an iteration
    pub busy: bool,
}

/// Shared connectivity and maintenance state.
#[derive(Debug)]
pub struct StateMachine {
    status: watch::Sender<ProcessStatus>,
    services: DashMap<ServiceId, ServiceRegistration>,
    activity: Notify,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ProcessStatus::default());
        Self {
            status,
            services: DashMap::new(),
            activity: Notify::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a loop.
    pub fn register(&self, service: &str, pause_for_maintenance: bool) {
        self.services.insert(
            service.to_string(),
            ServiceRegistration {
                pause_for_maintenance,
                ..Default::default()
            },
        );
        tracing::debug!(service = %service, pause_for_maintenance, "Service registered");
    }

    /// Current status.
    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    /// Normal → Waiting. Returns true if this call made the transition.
    pub fn enter_waiting(&self, reason: WaitReason) -> bool {
        let changed = self.status.send_if_modified(|status| status.enter_waiting(reason));
        if changed {
            tracing::warn!(reason = %reason, "Connectivity lost, entering waiting state");
        }
        changed
    }

    /// Waiting → Normal. Returns true if this call made the transition.
    pub fn restore(&self) -> bool {
        let changed = self.status.send_if_modified(|status| status.restore());
        if changed {
            tracing::info!(
                recovery_epoch = self.status().recovery_epoch,
                "Connectivity restored"
            );
        }
        changed
    }

    /// Ask every loop registered for maintenance to park at its next gate.
    pub fn begin_maintenance(&self) {
        if self.status.send_if_modified(|status| !std::mem::replace(&mut status.maintenance, true)) {
            tracing::info!("Maintenance window started");
        }
    }

    /// Release parked loops.
    pub fn end_maintenance(&self) {
        if self.status.send_if_modified(|status| std::mem::replace(&mut status.maintenance, false)) {
            tracing::info!("Maintenance window ended");
        }
    }

    /// Mark a loop busy unless it must stay parked for an open maintenance
    /// window. Returns false, leaving the loop idle, in that case.
    ///
    /// The maintenance flag is read while the registration is locked, so a
    /// concurrent [`StateMachine::wait_for_quiescence`] either sees the loop
    /// busy or the loop sees the window.
    pub fn claim_iteration(&self, service: &str, pause_for_maintenance: bool) -> bool {
        let claimed = match self.services.get_mut(service) {
            Some(mut registration) => {
                if registration.pause_for_maintenance && self.status.borrow().maintenance {
                    false
                } else {
                    registration.busy = true;
                    true
                }
            }
            None => !(pause_for_maintenance && self.status.borrow().maintenance),
        };
        self.activity.notify_waiters();
        claimed
    }

    pub fn set_paused(&self, service: &str, paused: bool) {
        self.update(service, |registration| registration.paused = paused);
    }

    pub fn set_busy(&self, service: &str, busy: bool) {
        self.update(service, |registration| registration.busy = busy);
    }

    fn update(&self, service: &str, apply: impl FnOnce(&mut ServiceRegistration)) {
        if let Some(mut registration) = self.services.get_mut(service) {
            apply(registration.value_mut());
        }
        self.activity.notify_waiters();
    }

    /// True when no loop that must pause is inside an iteration.
    pub fn is_quiescent(&self) -> bool {
        self.services
            .iter()
            .filter(|entry| entry.pause_for_maintenance)
            .all(|entry| entry.paused || !entry.busy)
    }

    /// Wait until [`StateMachine::is_quiescent`] holds.
    pub async fn wait_for_quiescence(&self, tick: Duration, cancel: &CancellationToken) -> Result<()> {
        loop {
            let activity = self.activity.notified();
            if self.is_quiescent() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = activity => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Registrations ordered by service id.
    pub fn services(&self) -> Vec<(ServiceId, ServiceRegistration)> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_engine::ProcessState;

    #[test]
    fn test_transitions_are_reported_once() {
        let machine = StateMachine::new();
        assert!(machine.enter_waiting(WaitReason::DatabaseUnavailable));
        assert!(!machine.enter_waiting(WaitReason::SourceUnavailable));
        assert_eq!(
            machine.status().state,
            ProcessState::Waiting(WaitReason::DatabaseUnavailable)
        );

        assert!(machine.restore());
        assert!(!machine.restore());
        assert_eq!(machine.status().recovery_epoch, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.enter_waiting(WaitReason::SourceUnavailable);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state.wait_reason(), Some(WaitReason::SourceUnavailable));
    }

    #[test]
    fn test_quiescence_ignores_services_that_do_not_pause() {
        let machine = StateMachine::new();
        machine.register("LogRecordService", true);
        machine.register("DeviceService", false);

        machine.set_busy("DeviceService", true);
        assert!(machine.is_quiescent());

        machine.set_busy("LogRecordService", true);
        assert!(!machine.is_quiescent());

        machine.set_paused("LogRecordService", true);
        assert!(machine.is_quiescent());
    }

    #[tokio::test]
    async fn test_wait_for_quiescence_wakes_on_activity() {
        let machine = StateMachine::new_shared();
        machine.register("LogRecordService", true);
        machine.set_busy("LogRecordService", true);
        machine.begin_maintenance();
        assert!(machine.status().maintenance);

        let waiter = {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .wait_for_quiescence(Duration::from_secs(60), &CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        machine.set_busy("LogRecordService", false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        machine.end_maintenance();
        assert!(!machine.status().maintenance);
    }

    #[test]
    fn test_claim_refused_during_maintenance() {
        let machine = StateMachine::new();
        machine.register("LogRecordService", true);
        machine.register("DeviceService", false);

        assert!(machine.claim_iteration("LogRecordService", true));
        assert!(!machine.is_quiescent());
        machine.set_busy("LogRecordService", false);

        machine.begin_maintenance();
        assert!(!machine.claim_iteration("LogRecordService", true));
        assert!(machine.is_quiescent());
        assert!(machine.claim_iteration("DeviceService", false));
        assert!(!machine.claim_iteration("UnregisteredService", true));

        machine.end_maintenance();
        assert!(machine.claim_iteration("LogRecordService", true));
    }

    #[tokio::test]
    async fn test_wait_for_quiescence_is_cancellable() {
        let machine = StateMachine::new();
        machine.register("LogRecordService", true);
        machine.set_busy("LogRecordService", true);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            machine.wait_for_quiescence(Duration::from_secs(60), &cancel).await,
            Err(SyncError::Cancelled)
        ));
    }
}
