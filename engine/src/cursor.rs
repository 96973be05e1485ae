//! Feed versions and the durable per-service sync cursor.
//!
//! A [`SyncCursor`] tracks two positions in a remote change feed:
//!
//! 1. `last_feed_version` - the token returned by the most recent fetch
//! 2. `last_processed_feed_version` - the token whose batch is durably committed
//!
//! The processed position never passes the fetched one, and the fetched one
//! only moves backwards through an explicit [`SyncCursor::rollback_to`].

use crate::{error::Result, Error, ServiceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, monotonically increasing version token assigned by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedVersion(i64);

impl FeedVersion {
    /// Wrap a raw token value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// The raw token value.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for FeedVersion {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for FeedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replay position of one feed-driven service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Service that owns this cursor
    pub service_id: ServiceId,
    last_feed_version: Option<FeedVersion>,
    last_feed_retrieval_time_utc: Option<DateTime<Utc>>,
    last_processed_feed_version: Option<FeedVersion>,
}

impl SyncCursor {
    /// Create a cursor positioned at the beginning of the feed.
    pub fn new(service_id: impl Into<ServiceId>) -> Self {
        Self {
            service_id: service_id.into(),
            last_feed_version: None,
            last_feed_retrieval_time_utc: None,
            last_processed_feed_version: None,
        }
    }

    /// Seed a cursor from its durably committed position.
    pub fn from_committed(
        service_id: impl Into<ServiceId>,
        committed: Option<FeedVersion>,
        retrieved_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            last_feed_version: committed,
            last_feed_retrieval_time_utc: retrieved_at,
            last_processed_feed_version: committed,
        }
    }

    /// Version returned by the most recent fetch (the next `fromVersion`).
    pub fn last_feed_version(&self) -> Option<FeedVersion> {
        self.last_feed_version
    }

    /// Version whose batch has been durably committed.
    pub fn last_processed_feed_version(&self) -> Option<FeedVersion> {
        self.last_processed_feed_version
    }

    /// When the feed was last successfully read.
    pub fn last_feed_retrieval_time_utc(&self) -> Option<DateTime<Utc>> {
        self.last_feed_retrieval_time_utc
    }

    /// True if a fetched batch has not been committed yet.
    pub fn has_uncommitted(&self) -> bool {
        self.last_feed_version != self.last_processed_feed_version
    }

    /// Record the token returned by a successful fetch.
    pub fn record_fetch(&mut self, to_version: FeedVersion, retrieved_at: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.last_feed_version {
            if to_version < current {
                return Err(Error::CursorRegression {
                    service: self.service_id.clone(),
                    current,
                    attempted: to_version,
                });
            }
        }
        self.last_feed_version = Some(to_version);
        self.last_feed_retrieval_time_utc = Some(retrieved_at);
        Ok(())
    }

    /// Advance the processed position after the batch ending at `version`
    /// has been durably committed.
    pub fn mark_committed(&mut self, version: FeedVersion) -> Result<()> {
        match self.last_feed_version {
            Some(fetched) if version <= fetched => {}
            fetched => {
                return Err(Error::CommitBeyondFetched {
                    service: self.service_id.clone(),
                    attempted: version,
                    fetched,
                })
            }
        }
        if let Some(current) = self.last_processed_feed_version {
            if version < current {
                return Err(Error::CursorRegression {
                    service: self.service_id.clone(),
                    current,
                    attempted: version,
                });
            }
        }
        self.last_processed_feed_version = Some(version);
        Ok(())
    }

    /// Reset both positions to the last durably committed value.
    pub fn rollback_to(&mut self, committed: Option<FeedVersion>) {
        self.last_feed_version = committed;
        self.last_processed_feed_version = committed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn new_cursor_starts_at_beginning() {
        let cursor = SyncCursor::new("LogRecordService");
        assert_eq!(cursor.last_feed_version(), None);
        assert_eq!(cursor.last_processed_feed_version(), None);
        assert!(!cursor.has_uncommitted());
    }

    #[test]
    fn fetch_then_commit() {
        let mut cursor = SyncCursor::from_committed("svc", Some(FeedVersion::new(100)), None);
        cursor.record_fetch(FeedVersion::new(150), at(10)).unwrap();
        assert!(cursor.has_uncommitted());
        assert_eq!(cursor.last_processed_feed_version(), Some(FeedVersion::new(100)));

        cursor.mark_committed(FeedVersion::new(150)).unwrap();
        assert!(!cursor.has_uncommitted());
        assert_eq!(cursor.last_feed_retrieval_time_utc(), Some(at(10)));
    }

    #[test]
    fn fetch_cannot_regress() {
        let mut cursor = SyncCursor::from_committed("svc", Some(FeedVersion::new(100)), None);
        let err = cursor.record_fetch(FeedVersion::new(90), at(1)).unwrap_err();
        assert!(matches!(err, Error::CursorRegression { .. }));
        assert_eq!(cursor.last_feed_version(), Some(FeedVersion::new(100)));
    }

    #[test]
    fn commit_cannot_pass_fetched() {
        let mut cursor = SyncCursor::new("svc");
        cursor.record_fetch(FeedVersion::new(10), at(1)).unwrap();
        let err = cursor.mark_committed(FeedVersion::new(11)).unwrap_err();
        assert!(matches!(err, Error::CommitBeyondFetched { .. }));

        let mut fresh = SyncCursor::new("svc");
        assert!(fresh.mark_committed(FeedVersion::new(1)).is_err());
    }

    #[test]
    fn rollback_restores_committed_position() {
        let mut cursor = SyncCursor::from_committed("svc", Some(FeedVersion::new(100)), None);
        cursor.record_fetch(FeedVersion::new(150), at(1)).unwrap();
        cursor.rollback_to(Some(FeedVersion::new(100)));
        assert_eq!(cursor.last_feed_version(), Some(FeedVersion::new(100)));
        assert!(!cursor.has_uncommitted());
    }

    #[test]
    fn serialization_format() {
        let cursor = SyncCursor::from_committed("svc", Some(FeedVersion::new(7)), None);
        let json = serde_json::to_string(&cursor).unwrap();
        assert!(json.contains("\"serviceId\":\"svc\""));
        assert!(json.contains("\"lastProcessedFeedVersion\":7"));
    }
}
