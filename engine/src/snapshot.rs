//! In-memory snapshot of a reference entity population.
//!
//! The snapshot is rebuilt at start-up and on every Refresh; it is never
//! persisted. The database copy stays authoritative, so the snapshot only has
//! to remember what changed since it was last propagated there.
//!
//! Uses BTreeMap so iteration (and therefore staging order) is deterministic.

use crate::{EntityKey, Keyed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the snapshot was last brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheOperationType {
    /// Only records changed since the previous cycle were fetched
    IncrementalUpdate,
    /// The entire population was re-fetched and replaced
    Refresh,
}

/// Key → record map plus change tracking.
#[derive(Debug, Clone)]
pub struct CacheSnapshot<T> {
    items: BTreeMap<EntityKey, T>,
    changed_in_last_update: Vec<T>,
    pending_changes: BTreeSet<EntityKey>,
    refresh_pending: bool,
    last_updated_time_utc: Option<DateTime<Utc>>,
    last_refreshed_time_utc: Option<DateTime<Utc>>,
    last_propagated_to_database_time_utc: Option<DateTime<Utc>>,
    last_cache_operation_type: Option<CacheOperationType>,
}

impl<T> Default for CacheSnapshot<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            changed_in_last_update: Vec::new(),
            pending_changes: BTreeSet::new(),
            refresh_pending: false,
            last_updated_time_utc: None,
            last_refreshed_time_utc: None,
            last_propagated_to_database_time_utc: None,
            last_cache_operation_type: None,
        }
    }
}

impl<T: Keyed + Clone + PartialEq> CacheSnapshot<T> {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge records changed since the last cycle into the map.
    ///
    /// Returns the number of records that were new or different.
    pub fn apply_incremental(&mut self, records: Vec<T>, at: DateTime<Utc>) -> usize {
        let mut changed = Vec::new();
        for record in records {
            let key = record.key();
            if self.items.get(&key) != Some(&record) {
                changed.push(record.clone());
                self.pending_changes.insert(key.clone());
                self.items.insert(key, record);
            }
        }
        self.finish_cycle(changed, CacheOperationType::IncrementalUpdate, at)
    }

    /// Replace the whole population. Keys missing from `records` disappear
    /// from the snapshot; the next reconciliation soft-deletes them.
    ///
    /// Returns the number of records that were new or different.
    pub fn apply_refresh(&mut self, records: Vec<T>, at: DateTime<Utc>) -> usize {
        let mut next = BTreeMap::new();
        let mut changed = Vec::new();
        for record in records {
            let key = record.key();
            if self.items.get(&key) != Some(&record) && !next.contains_key(&key) {
                changed.push(record.clone());
                self.pending_changes.insert(key.clone());
            }
            next.insert(key, record);
        }
        self.pending_changes.retain(|key| next.contains_key(key));
        self.items = next;
        self.refresh_pending = true;
        self.last_refreshed_time_utc = Some(at);
        self.finish_cycle(changed, CacheOperationType::Refresh, at)
    }

    fn finish_cycle(&mut self, changed: Vec<T>, operation: CacheOperationType, at: DateTime<Utc>) -> usize {
        let count = changed.len();
        self.changed_in_last_update = changed;
        self.last_cache_operation_type = Some(operation);
        self.last_updated_time_utc = Some(at);
        count
    }

    /// Get a record by key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.get(key)
    }

    /// Check if a key is cached.
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// All cached records, ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &T)> {
        self.items.iter()
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records that were new or different in the most recent cycle.
    pub fn changed_in_last_update(&self) -> &[T] {
        &self.changed_in_last_update
    }

    /// Records changed since the snapshot was last propagated to the
    /// database, ordered by key. Survives failed propagation attempts.
    pub fn changes_since_propagation(&self) -> impl Iterator<Item = &T> {
        self.pending_changes
            .iter()
            .filter_map(move |key| self.items.get(key))
    }

    /// True if a Refresh happened since the last successful propagation.
    pub fn refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    /// True if anything must still be written to the database.
    pub fn has_unpropagated_changes(&self) -> bool {
        self.refresh_pending || !self.pending_changes.is_empty()
    }

    /// Record a successful propagation to the database.
    pub fn mark_propagated(&mut self, at: DateTime<Utc>) {
        self.pending_changes.clear();
        self.refresh_pending = false;
        self.last_propagated_to_database_time_utc = Some(at);
    }

    /// When the snapshot was last updated (either mode).
    pub fn last_updated_time_utc(&self) -> Option<DateTime<Utc>> {
        self.last_updated_time_utc
    }

    /// When the snapshot was last fully refreshed.
    pub fn last_refreshed_time_utc(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_time_utc
    }

    /// When changes were last written to the database.
    pub fn last_propagated_to_database_time_utc(&self) -> Option<DateTime<Utc>> {
        self.last_propagated_to_database_time_utc
    }

    /// Mode of the most recent cycle.
    pub fn last_cache_operation_type(&self) -> Option<CacheOperationType> {
        self.last_cache_operation_type
    }
}
