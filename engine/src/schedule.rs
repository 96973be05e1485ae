//! Timing of reference cache updates.
//!
//! Refreshes are anchored to a daily reference time and repeat every
//! `refresh_interval` from that anchor. Between refreshes the cache runs
//! incremental updates every `update_interval`.

use crate::{error::Result, CacheOperationType, Error};
use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Decides whether a cache cycle is due and in which mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSchedule {
    daily_refresh_reference_time: NaiveTime,
    update_interval: Duration,
    refresh_interval: Duration,
}

impl CacheSchedule {
    /// Create a schedule. Both intervals must be positive.
    pub fn new(
        daily_refresh_reference_time: NaiveTime,
        update_interval_minutes: u32,
        refresh_interval_minutes: u32,
    ) -> Result<Self> {
        if update_interval_minutes == 0 {
            return Err(Error::InvalidInterval(
                "update interval must be at least one minute".into(),
            ));
        }
        if refresh_interval_minutes == 0 {
            return Err(Error::InvalidInterval(
                "refresh interval must be at least one minute".into(),
            ));
        }
        Ok(Self {
            daily_refresh_reference_time,
            update_interval: Duration::minutes(i64::from(update_interval_minutes)),
            refresh_interval: Duration::minutes(i64::from(refresh_interval_minutes)),
        })
    }

    /// Interval between incremental updates.
    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// First refresh slot strictly after `last_refresh`.
    pub fn next_refresh_after(&self, last_refresh: DateTime<Utc>) -> DateTime<Utc> {
        let anchor = last_refresh
            .date_naive()
            .and_time(self.daily_refresh_reference_time)
            .and_utc();
        let step = self.refresh_interval.num_seconds();
        let offset = (last_refresh - anchor).num_seconds();
        let slots = offset.div_euclid(step) + 1;
        anchor + Duration::seconds(slots * step)
    }

    /// Mode of the cycle due at `now`, if any.
    pub fn due(
        &self,
        now: DateTime<Utc>,
        last_updated: Option<DateTime<Utc>>,
        last_refreshed: Option<DateTime<Utc>>,
    ) -> Option<CacheOperationType> {
        let Some(last_refreshed) = last_refreshed else {
            return Some(CacheOperationType::Refresh);
        };
        if now >= self.next_refresh_after(last_refreshed) {
            return Some(CacheOperationType::Refresh);
        }
        match last_updated {
            Some(last) if now - last < self.update_interval => None,
            _ => Some(CacheOperationType::IncrementalUpdate),
        }
    }
}
