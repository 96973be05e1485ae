//! Building the rows of one staging batch.
//!
//! A key is inserted at most once per batch. If the same natural key shows up
//! again, the later row is staged as an update so the merge step never sees
//! two inserts for one key.

use crate::{
    error::Result, EntityKey, Error, Keyed, RecordOperation, StagingRecord,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Per-operation row counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// Ordered rows for one truncate-write-merge cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingBatch {
    rows: Vec<StagingRecord>,
    seen: HashSet<EntityKey>,
}

impl StagingBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage every record of a feed batch. None of the keys are assumed to be
    /// persisted yet; repeats within the batch become updates.
    pub fn from_records<T: Keyed + Serialize>(records: &[T], changed_at: DateTime<Utc>) -> Result<Self> {
        let mut batch = Self::new();
        for record in records {
            let key = record.key();
            let payload = serde_json::to_value(record).map_err(|e| Error::InvalidPayload {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            batch.push_upsert(key, payload, false, changed_at)?;
        }
        Ok(batch)
    }

    /// Stage an active row. `persisted` tells whether the key already exists
    /// in the permanent table. Returns the operation the row was staged with.
    pub fn push_upsert(
        &mut self,
        key: impl Into<EntityKey>,
        payload: serde_json::Value,
        persisted: bool,
        changed_at: DateTime<Utc>,
    ) -> Result<RecordOperation> {
        let key = key.into();
        let operation = if persisted || self.seen.contains(&key) {
            RecordOperation::Update
        } else {
            RecordOperation::Insert
        };
        let record = StagingRecord::upsert(key.clone(), operation, payload, changed_at)?;
        self.seen.insert(key);
        self.rows.push(record);
        Ok(operation)
    }

    /// Stage a soft delete. Ignored if the key was already staged as active
    /// in this batch.
    pub fn push_delete(&mut self, key: impl Into<EntityKey>, key_column: &str, changed_at: DateTime<Utc>) -> bool {
        let key = key.into();
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.rows.push(StagingRecord::delete(key, key_column, changed_at));
        true
    }

    /// Check if a key has already been staged.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Staged rows, in order.
    pub fn rows(&self) -> &[StagingRecord] {
        &self.rows
    }

    /// Number of staged rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True if any row soft-deletes a key.
    pub fn has_deletes(&self) -> bool {
        self.rows
            .iter()
            .any(|r| r.operation == RecordOperation::Delete)
    }

    /// Count rows by operation.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for row in &self.rows {
            match row.operation {
                RecordOperation::Insert => counts.inserts += 1,
                RecordOperation::Update => counts.updates += 1,
                RecordOperation::Delete => counts.deletes += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Trip {
        id: String,
        distance: f64,
    }

    impl Keyed for Trip {
        fn key(&self) -> EntityKey {
            self.id.clone()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn duplicate_key_collapses_to_update() {
        let trips = vec![
            Trip { id: "t1".into(), distance: 1.0 },
            Trip { id: "t2".into(), distance: 2.0 },
            Trip { id: "t1".into(), distance: 1.5 },
        ];
        let batch = StagingBatch::from_records(&trips, now()).unwrap();

        let ops: Vec<_> = batch.rows().iter().map(|r| (r.key.as_str(), r.operation)).collect();
        assert_eq!(
            ops,
            vec![
                ("t1", RecordOperation::Insert),
                ("t2", RecordOperation::Insert),
                ("t1", RecordOperation::Update),
            ]
        );
        assert_eq!(batch.counts(), BatchCounts { inserts: 2, updates: 1, deletes: 0 });
        assert_eq!(batch.rows()[2].payload["distance"], 1.5);
    }

    #[test]
    fn persisted_key_is_update() {
        let mut batch = StagingBatch::new();
        let op = batch.push_upsert("d1", json!({"id": "d1"}), true, now()).unwrap();
        assert_eq!(op, RecordOperation::Update);
    }

    #[test]
    fn delete_ignored_after_upsert_of_same_key() {
        let mut batch = StagingBatch::new();
        batch.push_upsert("d1", json!({"id": "d1"}), true, now()).unwrap();
        assert!(!batch.push_delete("d1", "id", now()));
        assert!(batch.push_delete("d2", "id", now()));
        assert_eq!(batch.len(), 2);
        assert!(batch.has_deletes());
    }
}
