//! Full-population caching of reference entities.

use crate::error::{Result, SyncError};
use crate::source::{CacheSource, SourceRecord};
use chrono::{DateTime, NaiveTime, Utc};
use feedsync_engine::{CacheOperationType, CacheSchedule, CacheSnapshot, ServiceId};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

/// Settings of one reference cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub daily_refresh_reference_time: NaiveTime,
    pub update_interval_minutes: u32,
    pub refresh_interval_minutes: u32,
    pub page_limit: usize,
    /// Follow `next_page` tokens; when false only the first page is read
    pub fetch_all_pages: bool,
    /// Column the natural key is copied into
    pub key_column: String,
}

/// Keeps an in-memory snapshot of a reference entity population in line
/// with the source.
///
/// Only the owning loop writes the snapshot. Readers share it through
/// [`ReferenceCacheEngine::snapshot`].
pub struct ReferenceCacheEngine {
    service_id: ServiceId,
    entity_type: String,
    source: Arc<dyn CacheSource>,
    settings: Option<(CacheSettings, CacheSchedule)>,
    snapshot: RwLock<CacheSnapshot<SourceRecord>>,
}

impl ReferenceCacheEngine {
    pub fn new(service_id: impl Into<ServiceId>, entity_type: impl Into<String>, source: Arc<dyn CacheSource>) -> Self {
        Self {
            service_id: service_id.into(),
            entity_type: entity_type.into(),
            source,
            settings: None,
            snapshot: RwLock::new(CacheSnapshot::new()),
        }
    }

    /// Validate the schedule and build the snapshot with a full fetch.
    pub async fn initialize(&mut self, settings: CacheSettings, cancel: &CancellationToken) -> Result<()> {
        let schedule = CacheSchedule::new(
            settings.daily_refresh_reference_time,
            settings.update_interval_minutes,
            settings.refresh_interval_minutes,
        )?;
        if settings.page_limit == 0 {
            return Err(feedsync_engine::Error::InvalidPageLimit(0).into());
        }
        self.settings = Some((settings, schedule));
        let count = self.run_cycle(CacheOperationType::Refresh, cancel).await?;
        tracing::info!(service = %self.service_id, records = count, "Reference cache initialized");
        Ok(())
    }

    fn settings(&self) -> Result<&(CacheSettings, CacheSchedule)> {
        self.settings
            .as_ref()
            .ok_or_else(|| SyncError::Fatal(format!("{} cache used before initialize", self.service_id)))
    }

    /// Shared, read-only view of the snapshot.
    pub async fn snapshot(&self) -> RwLockReadGuard<'_, CacheSnapshot<SourceRecord>> {
        self.snapshot.read().await
    }

    /// Mode of the cycle due at `now`, if any.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Option<CacheOperationType>> {
        let (_, schedule) = self.settings()?;
        let snapshot = self.snapshot.read().await;
        Ok(schedule.due(
            now,
            snapshot.last_updated_time_utc(),
            snapshot.last_refreshed_time_utc(),
        ))
    }

    /// Minimum time between incremental updates.
    pub fn update_interval(&self) -> Option<std::time::Duration> {
        self.settings
            .as_ref()
            .and_then(|(_, schedule)| schedule.update_interval().to_std().ok())
    }

    /// Run whichever cycle is due at `now`. Returns the cycle that ran and
    /// the number of changed records, or `None` if nothing was due.
    pub async fn update(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<(CacheOperationType, usize)>> {
        match self.due(now).await? {
            Some(operation) => Ok(Some((operation, self.run_cycle(operation, cancel).await?))),
            None => Ok(None),
        }
    }

    /// Fetch and apply one cycle. Returns the number of new or changed
    /// records.
    ///
    /// An incremental update asks only for records changed since the
    /// previous cycle started; a refresh re-reads the whole population and
    /// replaces the snapshot. The cycle is stamped with its start time so
    /// changes made while it runs are picked up next time.
    pub async fn run_cycle(&self, operation: CacheOperationType, cancel: &CancellationToken) -> Result<usize> {
        let started = Utc::now();
        let changed_since = match operation {
            CacheOperationType::Refresh => None,
            CacheOperationType::IncrementalUpdate => self.snapshot.read().await.last_updated_time_utc(),
        };

        let records = self.fetch_all(changed_since, cancel).await?;
        let fetched = records.len();

        let mut snapshot = self.snapshot.write().await;
        let changed = match operation {
            CacheOperationType::Refresh => snapshot.apply_refresh(records, started),
            CacheOperationType::IncrementalUpdate => snapshot.apply_incremental(records, started),
        };
        tracing::debug!(
            service = %self.service_id,
            operation = ?operation,
            fetched,
            changed,
            cached = snapshot.len(),
            "Cache cycle complete"
        );
        Ok(changed)
    }

    async fn fetch_all(
        &self,
        changed_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceRecord>> {
        let (settings, _) = self.settings()?;
        let mut records = Vec::new();
        let mut page: Option<String> = None;

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                fetched = self.source.fetch_page(
                    &self.entity_type,
                    changed_since,
                    page.as_deref(),
                    settings.page_limit,
                ) => fetched?,
            };

            records.extend(
                fetched
                    .records
                    .into_iter()
                    .map(|r| r.keyed_as(&settings.key_column)),
            );

            match fetched.next_page {
                Some(next) if settings.fetch_all_pages => page = Some(next),
                _ => break,
            }
        }

        Ok(records)
    }

    /// Record that every change up to now has reached the database.
    pub async fn mark_propagated(&self, at: DateTime<Utc>) {
        self.snapshot.write().await.mark_propagated(at);
    }
}
