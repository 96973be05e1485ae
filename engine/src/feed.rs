//! In-memory state of an incremental feed reader.
//!
//! [`FeedState`] owns the cursor, the page limit and the buffer of the most
//! recently fetched batch. It performs no IO; the async engine feeds it the
//! [`FeedBatch`] returned by a remote call and asks it where to read next.

use crate::{error::Result, Error, FeedVersion, ServiceId, SyncCursor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Records plus the new cursor token returned atomically by one source call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedBatch<T> {
    /// Raw source records, in feed order
    #[serde(rename = "data")]
    pub records: Vec<T>,
    /// Token to resume from on the next call
    pub to_version: FeedVersion,
}

impl<T> FeedBatch<T> {
    /// Create a batch.
    pub fn new(records: Vec<T>, to_version: FeedVersion) -> Self {
        Self {
            records,
            to_version,
        }
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the batch carries no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Cursor, buffer and pacing state of one feed reader.
#[derive(Debug, Clone)]
pub struct FeedState<T> {
    cursor: SyncCursor,
    page_limit: usize,
    effective_limit: usize,
    poll_interval: Duration,
    buffer: Vec<T>,
    caught_up: bool,
    delay_next_poll: bool,
}

impl<T> FeedState<T> {
    /// Set up a reader seeded from the durable position (`None` reads from
    /// the beginning of the feed).
    pub fn new(
        service_id: impl Into<ServiceId>,
        poll_interval: Duration,
        page_limit: usize,
        starting: Option<FeedVersion>,
    ) -> Result<Self> {
        if page_limit == 0 {
            return Err(Error::InvalidPageLimit(page_limit));
        }
        Ok(Self {
            cursor: SyncCursor::from_committed(service_id, starting, None),
            page_limit,
            effective_limit: page_limit,
            poll_interval,
            buffer: Vec::new(),
            caught_up: false,
            delay_next_poll: false,
        })
    }

    /// The underlying cursor.
    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Position to request on the next fetch.
    pub fn from_version(&self) -> Option<FeedVersion> {
        self.cursor.last_feed_version()
    }

    /// Page size to request on the next fetch.
    pub fn request_limit(&self) -> usize {
        self.effective_limit
    }

    /// Configured poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Lower the page size for sinks that need smaller batches.
    ///
    /// `None` restores the configured limit. The limit never drops below 1.
    pub fn limit_page_size(&mut self, max: Option<usize>) {
        self.effective_limit = match max {
            Some(max) => max.clamp(1, self.page_limit),
            None => self.page_limit,
        };
    }

    /// Buffer a fetched batch and move the fetched position forward.
    ///
    /// Returns the number of records buffered.
    pub fn apply_batch(&mut self, batch: FeedBatch<T>, retrieved_at: DateTime<Utc>) -> Result<usize> {
        self.cursor.record_fetch(batch.to_version, retrieved_at)?;
        let count = batch.records.len();
        self.caught_up = count < self.effective_limit;
        self.delay_next_poll = self.caught_up;
        self.buffer.extend(batch.records);
        Ok(count)
    }

    /// True iff the last fetch returned fewer records than the page limit.
    pub fn caught_up(&self) -> bool {
        self.caught_up
    }

    /// True if the reader should wait one poll interval before fetching again.
    pub fn should_delay(&self) -> bool {
        self.delay_next_poll
    }

    /// Advance the processed position once the batch ending at `version` is
    /// durably committed.
    pub fn mark_committed(&mut self, version: FeedVersion) -> Result<()> {
        self.cursor.mark_committed(version)
    }

    /// Reset to the last durably committed position and force an immediate
    /// re-fetch. Buffered, uncommitted records are discarded.
    pub fn rollback(&mut self, committed: Option<FeedVersion>) {
        self.cursor.rollback_to(committed);
        self.clear_buffer();
        self.caught_up = false;
        self.delay_next_poll = false;
    }

    /// Take the buffered records, leaving the buffer empty.
    pub fn drain_results(&mut self) -> Vec<T> {
        std::mem::take(&mut self.buffer)
    }

    /// Drop the buffered records and release their memory.
    pub fn clear_buffer(&mut self) {
        self.buffer = Vec::new();
    }

    /// Number of buffered records.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
