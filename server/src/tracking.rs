//! Per-service progress tracking.
//!
//! Every loop publishes its progress here after each iteration. The
//! dependency coordinator and the awaiter read it to decide when a waiting
//! loop may continue. Committed progress is also written to the durable
//! `service_tracking` table inside the same unit of work as the batch.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use feedsync_engine::{FeedVersion, ServiceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Version recorded with every tracking row.
pub const ADAPTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Durable progress of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTracking {
    pub service_id: ServiceId,
    pub adapter_version: String,
    pub machine_name: String,
    /// When the service last finished processing everything it had fetched
    pub entities_last_processed_utc: Option<DateTime<Utc>>,
    /// Feed position of the last committed batch (feed services only)
    pub last_processed_feed_version: Option<FeedVersion>,
    pub last_feed_retrieval_time_utc: Option<DateTime<Utc>>,
    pub record_last_changed_utc: DateTime<Utc>,
}

impl ServiceTracking {
    pub fn new(service_id: impl Into<ServiceId>, machine_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service_id: service_id.into(),
            adapter_version: ADAPTER_VERSION.to_string(),
            machine_name: machine_name.into(),
            entities_last_processed_utc: None,
            last_processed_feed_version: None,
            last_feed_retrieval_time_utc: None,
            record_last_changed_utc: now,
        }
    }
}

/// Process-wide view of every service's progress.
#[derive(Debug)]
pub struct ServiceTracker {
    machine_name: String,
    entries: DashMap<ServiceId, ServiceTracking>,
    started: DashSet<ServiceId>,
    progress: Notify,
}

impl ServiceTracker {
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            entries: DashMap::new(),
            started: DashSet::new(),
            progress: Notify::new(),
        }
    }

    pub fn new_shared(machine_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(machine_name))
    }

    /// Load durable rows read at startup.
    pub fn seed(&self, rows: impl IntoIterator<Item = ServiceTracking>) {
        for row in rows {
            self.entries.insert(row.service_id.clone(), row);
        }
    }

    pub fn get(&self, service: &str) -> Option<ServiceTracking> {
        self.entries.get(service).map(|entry| entry.value().clone())
    }

    /// All tracked services, ordered by id.
    pub fn all(&self) -> Vec<ServiceTracking> {
        let mut rows: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        rows
    }

    /// Durable feed position of a service.
    pub fn committed_version(&self, service: &str) -> Option<FeedVersion> {
        self.entries
            .get(service)
            .and_then(|entry| entry.last_processed_feed_version)
    }

    /// Record that a service finished initializing in this process.
    pub fn mark_started(&self, service: &str) {
        if self.started.insert(service.to_string()) {
            tracing::info!(service = %service, "Service started");
            self.progress.notify_waiters();
        }
    }

    /// True once the service has initialized at least once in this process.
    pub fn has_started(&self, service: &str) -> bool {
        self.started.contains(service)
    }

    /// When the service last finished processing everything it had fetched.
    pub fn progress_of(&self, service: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(service)
            .and_then(|entry| entry.entities_last_processed_utc)
    }

    /// Build the tracking row to commit together with a batch. Nothing is
    /// published until [`ServiceTracker::record_commit`] is called.
    pub fn next_commit(
        &self,
        service: &str,
        at: DateTime<Utc>,
        feed: Option<(FeedVersion, Option<DateTime<Utc>>)>,
    ) -> ServiceTracking {
        let mut tracking = self
            .get(service)
            .unwrap_or_else(|| ServiceTracking::new(service, self.machine_name.clone(), at));
        tracking.adapter_version = ADAPTER_VERSION.to_string();
        tracking.machine_name = self.machine_name.clone();
        tracking.entities_last_processed_utc = Some(at);
        tracking.record_last_changed_utc = at;
        if let Some((version, retrieved_at)) = feed {
            tracking.last_processed_feed_version = Some(version);
            tracking.last_feed_retrieval_time_utc = retrieved_at;
        }
        tracking
    }

    /// Publish a tracking row that has been durably committed.
    pub fn record_commit(&self, tracking: ServiceTracking) {
        self.entries.insert(tracking.service_id.clone(), tracking);
        self.progress.notify_waiters();
    }

    /// Record an iteration that had nothing to write. Progress moves forward
    /// in memory only; the durable row is unchanged.
    pub fn record_iteration(&self, service: &str, at: DateTime<Utc>) {
        let tracking = self.next_commit(service, at, None);
        self.record_commit(tracking);
    }

    /// Future that resolves on the next progress notification.
    pub fn progressed(&self) -> Notified<'_> {
        self.progress.notified()
    }
}
