//! Edge case tests for feedsync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use feedsync_engine::{
    CacheOperationType, CacheSchedule, CacheSnapshot, EntityKey, EntityStatus, Error, FeedBatch,
    FeedState, FeedVersion, Keyed, RecordOperation, Reconciler, StagingBatch, SyncCursor,
};
use proptest::prelude::*;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct LogRecord {
    id: String,
    device_id: String,
    speed: f64,
}

impl Keyed for LogRecord {
    fn key(&self) -> EntityKey {
        self.id.clone()
    }
}

fn log(id: &str, speed: f64) -> LogRecord {
    LogRecord {
        id: id.into(),
        device_id: "b1".into(),
        speed,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

// ============================================================================
// Feed Cursor Edge Cases
// ============================================================================

#[test]
fn empty_batch_keeps_version_and_signals_caught_up() {
    let mut state: FeedState<LogRecord> =
        FeedState::new("LogRecordService", std::time::Duration::from_secs(5), 10, Some(FeedVersion::new(100)))
            .unwrap();

    let count = state
        .apply_batch(FeedBatch::new(Vec::new(), FeedVersion::new(100)), at(1))
        .unwrap();

    assert_eq!(count, 0);
    assert!(state.caught_up());
    assert!(state.should_delay());
    assert_eq!(state.from_version(), Some(FeedVersion::new(100)));
}

#[test]
fn regressing_token_is_rejected() {
    let mut state: FeedState<LogRecord> =
        FeedState::new("LogRecordService", std::time::Duration::from_secs(5), 2, Some(FeedVersion::new(100)))
            .unwrap();

    let err = state
        .apply_batch(FeedBatch::new(vec![log("r1", 1.0)], FeedVersion::new(90)), at(1))
        .unwrap_err();
    assert!(matches!(err, Error::CursorRegression { .. }));
    assert_eq!(state.buffered(), 0);
}

#[test]
fn zero_page_limit_rejected() {
    let result: Result<FeedState<LogRecord>, _> =
        FeedState::new("LogRecordService", std::time::Duration::from_secs(5), 0, None);
    assert_eq!(result.unwrap_err(), Error::InvalidPageLimit(0));
}

#[test]
fn page_size_limit_is_clamped() {
    let mut state: FeedState<LogRecord> =
        FeedState::new("LogRecordService", std::time::Duration::from_secs(5), 500, None).unwrap();

    state.limit_page_size(Some(0));
    assert_eq!(state.request_limit(), 1);
    state.limit_page_size(Some(10_000));
    assert_eq!(state.request_limit(), 500);
    state.limit_page_size(None);
    assert_eq!(state.request_limit(), 500);
}

#[test]
fn commit_beyond_fetched_is_rejected() {
    let mut cursor = SyncCursor::new("LogRecordService");
    assert!(matches!(
        cursor.mark_committed(FeedVersion::new(1)),
        Err(Error::CommitBeyondFetched { fetched: None, .. })
    ));

    cursor.record_fetch(FeedVersion::new(10), at(1)).unwrap();
    assert!(cursor.mark_committed(FeedVersion::new(11)).is_err());
    assert!(cursor.mark_committed(FeedVersion::new(10)).is_ok());
    assert!(!cursor.has_uncommitted());
}

#[test]
fn rollback_to_beginning_of_feed() {
    let mut state: FeedState<LogRecord> =
        FeedState::new("LogRecordService", std::time::Duration::from_secs(5), 2, None).unwrap();
    state
        .apply_batch(FeedBatch::new(vec![log("r1", 1.0)], FeedVersion::new(5)), at(1))
        .unwrap();

    state.rollback(None);
    assert_eq!(state.from_version(), None);
    assert_eq!(state.buffered(), 0);
    assert!(!state.should_delay());
}

// ============================================================================
// Staging Edge Cases
// ============================================================================

#[test]
fn non_object_payload_rejected() {
    let mut batch = StagingBatch::new();
    let err = batch.push_upsert("k1", json!([1, 2, 3]), false, at(1)).unwrap_err();
    assert!(matches!(err, Error::InvalidPayload { .. }));
    assert!(batch.is_empty());
}

#[test]
fn staging_row_carries_bookkeeping_columns() {
    let batch = StagingBatch::from_records(&[log("r1", 42.5)], at(1_700_000_000)).unwrap();
    let row = batch.rows()[0].to_row();

    assert_eq!(row["id"], "r1");
    assert_eq!(row["speed"], 42.5);
    assert_eq!(row["entity_status"], 1);
    assert_eq!(row["record_operation"], "insert");
    assert_eq!(row["record_last_changed_utc"], "2023-11-14T22:13:20+00:00");
}

#[test]
fn unicode_keys_survive_staging() {
    let keys = ["日本語", "Привет", "🎉🚀", "with space", "quote'd"];
    let records: Vec<_> = keys.iter().map(|k| log(k, 0.0)).collect();
    let batch = StagingBatch::from_records(&records, at(1)).unwrap();

    assert_eq!(batch.len(), keys.len());
    for (row, key) in batch.rows().iter().zip(keys) {
        assert_eq!(row.key, key);
        assert_eq!(row.operation, RecordOperation::Insert);
    }
}

// ============================================================================
// Reconciliation Edge Cases
// ============================================================================

#[test]
fn refresh_to_empty_population_deletes_everything_active() {
    let mut snapshot: CacheSnapshot<LogRecord> = CacheSnapshot::new();
    snapshot.apply_refresh(Vec::new(), at(1));

    let persisted: HashMap<EntityKey, EntityStatus> = [
        ("a".to_string(), EntityStatus::Active),
        ("b".to_string(), EntityStatus::Active),
        ("c".to_string(), EntityStatus::Deleted),
    ]
    .into_iter()
    .collect();

    let result = Reconciler::new("id", &persisted).reconcile(&snapshot, at(2)).unwrap();
    assert_eq!(result.deleted, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(result.batch.counts().deletes, 2);
}

#[test]
fn failed_propagation_is_retried_on_next_cycle() {
    let mut snapshot = CacheSnapshot::new();
    snapshot.apply_refresh(vec![log("r1", 1.0)], at(1));
    snapshot.apply_incremental(vec![log("r2", 2.0)], at(2));

    // Nothing was propagated, so both cycles' changes are still pending.
    let persisted = HashMap::new();
    let result = Reconciler::new("id", &persisted).reconcile(&snapshot, at(3)).unwrap();
    assert_eq!(result.inserted, vec!["r1".to_string(), "r2".to_string()]);
    assert!(snapshot.refresh_pending());
}

#[test]
fn refresh_record_repeated_in_source_collapses() {
    let mut snapshot = CacheSnapshot::new();
    let changed = snapshot.apply_refresh(vec![log("r1", 1.0), log("r1", 2.0)], at(1));

    assert_eq!(changed, 1);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("r1").unwrap().speed, 2.0);
}

// ============================================================================
// Schedule Edge Cases
// ============================================================================

#[test]
fn refresh_due_across_midnight() {
    let schedule = CacheSchedule::new(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), 15, 1440).unwrap();
    let refreshed = Utc.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap();

    assert_eq!(
        schedule.next_refresh_after(refreshed),
        Utc.with_ymd_and_hms(2024, 2, 1, 23, 30, 0).unwrap()
    );
    assert_eq!(
        schedule.due(refreshed + Duration::hours(1), Some(refreshed), Some(refreshed)),
        Some(CacheOperationType::IncrementalUpdate)
    );
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_processed_never_exceeds_fetched(steps in prop::collection::vec((0i64..50, any::<bool>()), 1..40)) {
        let mut cursor = SyncCursor::new("LogRecordService");
        let mut version = 0i64;

        for (advance, commit) in steps {
            version += advance;
            cursor.record_fetch(FeedVersion::new(version), at(version)).unwrap();
            if commit {
                cursor.mark_committed(FeedVersion::new(version)).unwrap();
            }
            prop_assert!(cursor.last_processed_feed_version() <= cursor.last_feed_version());
        }
    }

    #[test]
    fn prop_staging_has_one_insert_per_key(keys in prop::collection::vec("[a-e]", 0..30)) {
        let records: Vec<_> = keys.iter().map(|k| log(k, 0.0)).collect();
        let batch = StagingBatch::from_records(&records, at(1)).unwrap();

        let mut inserts: HashMap<&str, usize> = HashMap::new();
        for row in batch.rows() {
            if row.operation == RecordOperation::Insert {
                *inserts.entry(row.key.as_str()).or_default() += 1;
            }
        }
        prop_assert!(inserts.values().all(|count| *count == 1));
        prop_assert_eq!(batch.len(), records.len());
    }

    #[test]
    fn prop_incremental_never_deletes(
        cached in prop::collection::btree_set("[a-h]", 0..8),
        persisted_keys in prop::collection::btree_set("[a-h]", 0..8),
    ) {
        let mut snapshot = CacheSnapshot::new();
        snapshot.apply_refresh(cached.iter().map(|k| log(k, 0.0)).collect(), at(1));
        snapshot.mark_propagated(at(2));
        snapshot.apply_incremental(Vec::new(), at(3));

        let persisted: HashMap<EntityKey, EntityStatus> = persisted_keys
            .iter()
            .map(|k| (k.clone(), EntityStatus::Active))
            .collect();
        let result = Reconciler::new("id", &persisted).reconcile(&snapshot, at(4)).unwrap();

        prop_assert!(result.deleted.is_empty());
        prop_assert!(!result.batch.has_deletes());
    }
}
