//! Reconciliation of a cache snapshot against the persisted table.
//!
//! # Algorithm
//!
//! 1. Stage every record changed since the last propagation: keys not yet
//!    persisted are inserts, everything else is an update
//! 2. Stage any cached record whose persisted row is missing or Deleted, so
//!    the table heals after failed propagations and source-side restores
//! 3. Only if a Refresh is pending: soft-delete every persisted Active key
//!    that is absent from the snapshot. An incremental update cannot prove
//!    absence, so it never deletes
//!
//! Duplicate keys within one pass collapse into a single row (see
//! [`StagingBatch`]).

use crate::{
    error::Result, CacheSnapshot, EntityKey, EntityStatus, Error, Keyed, RecordOperation,
    StagingBatch,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    /// Rows to stage and merge
    pub batch: StagingBatch,
    /// Keys staged as inserts
    pub inserted: Vec<EntityKey>,
    /// Keys staged as updates (including reactivations)
    pub updated: Vec<EntityKey>,
    /// Keys staged as soft deletes
    pub deleted: Vec<EntityKey>,
}

impl ReconcileResult {
    fn new() -> Self {
        Self {
            batch: StagingBatch::new(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Check if nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Diffs a snapshot against persisted keys and statuses.
pub struct Reconciler<'a> {
    key_column: &'a str,
    persisted: &'a HashMap<EntityKey, EntityStatus>,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler over the persisted key → status map of a table
    /// whose natural key lives in `key_column`.
    pub fn new(key_column: &'a str, persisted: &'a HashMap<EntityKey, EntityStatus>) -> Self {
        Self {
            key_column,
            persisted,
        }
    }

    /// Build the staging rows that bring the table in line with `snapshot`.
    pub fn reconcile<T>(&self, snapshot: &CacheSnapshot<T>, now: DateTime<Utc>) -> Result<ReconcileResult>
    where
        T: Keyed + Clone + PartialEq + Serialize,
    {
        let mut result = ReconcileResult::new();

        for record in snapshot.changes_since_propagation() {
            self.stage_active(&mut result, record, now)?;
        }

        for (key, record) in snapshot.iter() {
            match self.persisted.get(key) {
                Some(EntityStatus::Active) => {}
                _ => self.stage_active(&mut result, record, now)?,
            }
        }

        if snapshot.refresh_pending() {
            let mut absent: Vec<&EntityKey> = self
                .persisted
                .iter()
                .filter(|(key, status)| **status == EntityStatus::Active && !snapshot.contains(key))
                .map(|(key, _)| key)
                .collect();
            absent.sort();
            for key in absent {
                if result.batch.push_delete(key.clone(), self.key_column, now) {
                    result.deleted.push(key.clone());
                }
            }
        }

        Ok(result)
    }

    fn stage_active<T: Keyed + Serialize>(
        &self,
        result: &mut ReconcileResult,
        record: &T,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = record.key();
        if result.batch.contains(&key) {
            return Ok(());
        }
        let payload = serde_json::to_value(record).map_err(|e| Error::InvalidPayload {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let persisted = self.persisted.contains_key(&key);
        match result.batch.push_upsert(key.clone(), payload, persisted, now)? {
            RecordOperation::Insert => result.inserted.push(key),
            _ => result.updated.push(key),
        }
        Ok(())
    }
}
