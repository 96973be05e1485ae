//! One iteration of a sync loop, for each kind of entity.
//!
//! A [`SyncWorker`] knows how to pull new data for its entity type and write
//! it. Everything around that (gating, failure routing, pacing) lives in
//! [`crate::runner::ServiceRunner`], which is the same for every worker.

use crate::cache_engine::{CacheSettings, ReferenceCacheEngine};
use crate::error::{Result, SyncError};
use crate::feed_engine::FeedCursorEngine;
use crate::persister::EntityPersister;
use crate::tracking::ServiceTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_engine::{Error as EngineError, Reconciler, ServiceId, SqlIdentifier, StagingBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of one successful iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationOutcome {
    /// Rows written
    pub records: usize,
    /// Sleep one poll interval before the next iteration
    pub wait_before_next: bool,
}

/// Entity-specific half of a sync loop.
#[async_trait]
pub trait SyncWorker: Send + Sync {
    fn service_id(&self) -> &str;

    /// One-time setup before the first iteration.
    async fn initialize(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Fetch and persist whatever is new. `restored` is true on the first
    /// iteration after connectivity came back.
    async fn run_iteration(&mut self, restored: bool, cancel: &CancellationToken) -> Result<IterationOutcome>;

    fn poll_interval(&self) -> Duration;
}

/// Incremental loop over a cursor-based feed.
pub struct FeedWorker {
    service_id: ServiceId,
    engine: FeedCursorEngine,
    persister: EntityPersister,
    tracker: Arc<ServiceTracker>,
    poll_interval: Duration,
    page_limit: usize,
    sink_page_limit: Option<usize>,
    key_column: String,
}

impl FeedWorker {
    pub fn new(
        engine: FeedCursorEngine,
        persister: EntityPersister,
        tracker: Arc<ServiceTracker>,
        poll_interval: Duration,
        page_limit: usize,
        key_column: impl Into<String>,
    ) -> Self {
        let service_id = engine.service_id().to_string();
        Self {
            service_id,
            engine,
            persister,
            tracker,
            poll_interval,
            page_limit,
            sink_page_limit: None,
            key_column: key_column.into(),
        }
    }

    /// Ask the source for at most `limit` records per page.
    pub fn with_sink_page_limit(mut self, limit: Option<usize>) -> Self {
        self.sink_page_limit = limit;
        self
    }
}

#[async_trait]
impl SyncWorker for FeedWorker {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn initialize(&mut self, _cancel: &CancellationToken) -> Result<()> {
        let starting = self.tracker.committed_version(&self.service_id);
        self.engine
            .initialize(self.poll_interval, self.page_limit, starting)?;
        self.engine.limit_page_size(self.sink_page_limit)
    }

    async fn run_iteration(&mut self, restored: bool, cancel: &CancellationToken) -> Result<IterationOutcome> {
        if restored || self.engine.has_uncommitted() {
            let committed = self.tracker.committed_version(&self.service_id);
            self.engine.rollback(committed)?;
        }

        let committed = self.tracker.committed_version(&self.service_id);
        self.engine.fetch_batch(cancel).await?;
        let records = self.engine.drain_results()?;

        let (to_version, retrieved_at) = match self.engine.cursor() {
            Some(cursor) => (cursor.last_feed_version(), cursor.last_feed_retrieval_time_utc()),
            None => (None, None),
        };
        let to_version = to_version
            .ok_or_else(|| SyncError::Fatal(format!("{} fetched without a feed version", self.service_id)))?;
        let now = Utc::now();

        if records.is_empty() && Some(to_version) == committed {
            self.tracker.record_iteration(&self.service_id, now);
            return Ok(IterationOutcome {
                records: 0,
                wait_before_next: self.engine.should_delay(),
            });
        }

        let records: Vec<_> = records
            .into_iter()
            .map(|r| r.keyed_as(&self.key_column))
            .collect();
        let batch = StagingBatch::from_records(&records, now)?;
        let tracking = self
            .tracker
            .next_commit(&self.service_id, now, Some((to_version, retrieved_at)));

        self.persister.persist(&batch, false, &tracking, cancel).await?;
        self.engine.mark_committed(to_version)?;
        self.tracker.record_commit(tracking);

        tracing::info!(
            service = %self.service_id,
            records = records.len(),
            to_version = %to_version,
            "Feed batch committed"
        );

        Ok(IterationOutcome {
            records: records.len(),
            wait_before_next: self.engine.should_delay(),
        })
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Time source for cache schedule decisions.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Loop keeping a permanent table in line with a reference cache.
pub struct CacheWorker {
    service_id: ServiceId,
    engine: ReferenceCacheEngine,
    persister: EntityPersister,
    tracker: Arc<ServiceTracker>,
    settings: CacheSettings,
    table: SqlIdentifier,
    key_column: SqlIdentifier,
    clock: Clock,
}

impl CacheWorker {
    pub fn new(
        service_id: impl Into<ServiceId>,
        engine: ReferenceCacheEngine,
        persister: EntityPersister,
        tracker: Arc<ServiceTracker>,
        settings: CacheSettings,
        table: SqlIdentifier,
        key_column: SqlIdentifier,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            engine,
            persister,
            tracker,
            settings,
            table,
            key_column,
            clock: Arc::new(Utc::now),
        }
    }

    /// Decide which cycle is due against `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Write everything the snapshot holds that the table does not.
    ///
    /// After a Refresh every cached record is staged so the merge can
    /// soft-delete whatever the batch does not mention.
    async fn propagate(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let now = Utc::now();
        let snapshot = self.engine.snapshot().await;
        if !snapshot.has_unpropagated_changes() {
            return Ok(0);
        }

        let persisted = self
            .persister
            .backend()
            .load_statuses(&self.table, &self.key_column)
            .await?;
        let refresh = snapshot.refresh_pending();
        let mut result = Reconciler::new(self.key_column.as_str(), &persisted).reconcile(&*snapshot, now)?;

        if refresh {
            for (key, record) in snapshot.iter() {
                if result.batch.contains(key) {
                    continue;
                }
                let payload = serde_json::to_value(record).map_err(|e| EngineError::InvalidPayload {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                result.batch.push_upsert(key.clone(), payload, true, now)?;
            }
        }
        drop(snapshot);

        let tracking = self.tracker.next_commit(&self.service_id, now, None);
        self.persister
            .persist(&result.batch, refresh, &tracking, cancel)
            .await?;
        self.engine.mark_propagated(now).await;
        self.tracker.record_commit(tracking);

        tracing::info!(
            service = %self.service_id,
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            deleted = result.deleted.len(),
            refresh,
            "Reference cache propagated"
        );
        Ok(result.inserted.len() + result.updated.len() + result.deleted.len())
    }
}

#[async_trait]
impl SyncWorker for CacheWorker {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn initialize(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.engine.initialize(self.settings.clone(), cancel).await
    }

    async fn run_iteration(&mut self, _restored: bool, cancel: &CancellationToken) -> Result<IterationOutcome> {
        let ran = self.engine.update((self.clock)(), cancel).await?;
        if let Some((operation, changed)) = ran {
            tracing::debug!(service = %self.service_id, operation = ?operation, changed, "Cache cycle ran");
        }

        let records = self.propagate(cancel).await?;
        if records == 0 {
            self.tracker.record_iteration(&self.service_id, Utc::now());
        }

        Ok(IterationOutcome {
            records,
            wait_before_next: true,
        })
    }

    fn poll_interval(&self) -> Duration {
        self.engine
            .update_interval()
            .unwrap_or(Duration::from_secs(60))
            .min(Duration::from_secs(60))
    }
}
