//! Incremental, cursor-based retrieval.

use crate::error::{Result, SyncError};
use crate::source::{FeedSource, SourceRecord};
use chrono::Utc;
use feedsync_engine::{FeedState, FeedVersion, ServiceId, SyncCursor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pulls pages from a [`FeedSource`] and buffers them until the caller has
/// committed them.
///
/// The engine never retries on its own: a failed fetch is returned to the
/// caller, which decides whether to wait for connectivity and roll back.
pub struct FeedCursorEngine {
    service_id: ServiceId,
    entity_type: String,
    source: Arc<dyn FeedSource>,
    state: Option<FeedState<SourceRecord>>,
}

impl FeedCursorEngine {
    pub fn new(service_id: impl Into<ServiceId>, entity_type: impl Into<String>, source: Arc<dyn FeedSource>) -> Self {
        Self {
            service_id: service_id.into(),
            entity_type: entity_type.into(),
            source,
            state: None,
        }
    }

    /// One-time setup. `starting` is the durable position, `None` to read
    /// from the beginning of the feed.
    pub fn initialize(&mut self, poll_interval: Duration, page_limit: usize, starting: Option<FeedVersion>) -> Result<()> {
        self.state = Some(FeedState::new(
            self.service_id.clone(),
            poll_interval,
            page_limit,
            starting,
        )?);
        tracing::info!(
            service = %self.service_id,
            page_limit,
            starting = ?starting.map(|v| v.get()),
            "Feed cursor initialized"
        );
        Ok(())
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    fn state(&self) -> Result<&FeedState<SourceRecord>> {
        self.state
            .as_ref()
            .ok_or_else(|| SyncError::Fatal(format!("{} feed used before initialize", self.service_id)))
    }

    fn state_mut(&mut self) -> Result<&mut FeedState<SourceRecord>> {
        let service_id = &self.service_id;
        self.state
            .as_mut()
            .ok_or_else(|| SyncError::Fatal(format!("{} feed used before initialize", service_id)))
    }

    /// Fetch the next page and buffer it. Returns the number of records
    /// received.
    pub async fn fetch_batch(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let (from_version, limit) = {
            let state = self.state()?;
            (state.from_version(), state.request_limit())
        };

        let batch = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            batch = self.source.fetch_feed(&self.entity_type, from_version, limit) => batch?,
        };

        let count = self.state_mut()?.apply_batch(batch, Utc::now())?;
        tracing::debug!(
            service = %self.service_id,
            records = count,
            caught_up = self.caught_up(),
            "Fetched feed batch"
        );
        Ok(count)
    }

    /// Reset to the last durably committed position and drop anything
    /// buffered, so the next fetch replays from there without delay.
    pub fn rollback(&mut self, committed: Option<FeedVersion>) -> Result<()> {
        let service_id = self.service_id.clone();
        self.state_mut()?.rollback(committed);
        tracing::info!(
            service = %service_id,
            committed = ?committed.map(|v| v.get()),
            "Feed cursor rolled back"
        );
        Ok(())
    }

    pub fn drain_results(&mut self) -> Result<Vec<SourceRecord>> {
        Ok(self.state_mut()?.drain_results())
    }

    /// Lower the page size for a sink that needs smaller batches; `None`
    /// restores the configured limit.
    pub fn limit_page_size(&mut self, max: Option<usize>) -> Result<()> {
        self.state_mut()?.limit_page_size(max);
        Ok(())
    }

    pub fn caught_up(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.caught_up())
    }

    pub fn should_delay(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.should_delay())
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.state.as_ref().map(|s| s.poll_interval())
    }

    pub fn cursor(&self) -> Option<&SyncCursor> {
        self.state.as_ref().map(|s| s.cursor())
    }

    /// True if records were fetched past the last committed position.
    pub fn has_uncommitted(&self) -> bool {
        self.cursor().is_some_and(|c| c.has_uncommitted())
    }

    /// Advance the processed position after the batch ending at `version`
    /// committed.
    pub fn mark_committed(&mut self, version: FeedVersion) -> Result<()> {
        self.state_mut()?.mark_committed(version)?;
        Ok(())
    }
}
