//! In-memory backend.
//!
//! Behaves like a small relational store: permanent tables keyed by a natural
//! key column, staging areas, merge routines registered by name and simple
//! foreign keys. A unit of work holds the store lock until it finishes and
//! restores the previous contents unless it commits.
//!
//! Failures can be injected per operation with [`MemoryBackend::fail_next`].

use super::backend::{PersistenceBackend, StorageResult, UnitOfWork};
use crate::config::{MergeRoutine, UpsertTarget};
use crate::error::StorageError;
use crate::tracking::ServiceTracking;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use feedsync_engine::{
    EntityKey, EntityStatus, ServiceId, SqlIdentifier, ENTITY_STATUS_COLUMN,
    RECORD_LAST_CHANGED_COLUMN, RECORD_OPERATION_COLUMN,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Begin,
    TruncateStaging,
    WriteStaging,
    Merge,
    Upsert,
    SoftDelete,
    SaveTracking,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    key_column: String,
    rows: BTreeMap<EntityKey, Value>,
}

#[derive(Debug, Clone)]
struct MergeBinding {
    staging: String,
    table: String,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    name: String,
    table: String,
    field: String,
    parent_table: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    staging: HashMap<String, Vec<Value>>,
    merges: HashMap<String, MergeBinding>,
    foreign_keys: Vec<ForeignKey>,
    tracking: BTreeMap<ServiceId, ServiceTracking>,
    merge_calls: usize,
}

impl MemoryState {
    fn table(&self, name: &str) -> StorageResult<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::other(format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> StorageResult<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::other(format!("relation \"{}\" does not exist", name)))
    }

    fn check_foreign_keys(&self, table: &str, row: &Value) -> StorageResult<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(parent_key) = row.get(&fk.field).and_then(value_key) else {
                continue;
            };
            let exists = self
                .tables
                .get(&fk.parent_table)
                .is_some_and(|parent| parent.rows.contains_key(&parent_key));
            if !exists {
                return Err(StorageError::foreign_key(
                    Some(&fk.name),
                    format!(
                        "insert or update on table \"{}\" violates foreign key constraint \"{}\"",
                        table, fk.name
                    ),
                ));
            }
        }
        Ok(())
    }

    fn write_row(&mut self, table: &str, row: &Value, update_columns: Option<&[SqlIdentifier]>) -> StorageResult<()> {
        self.check_foreign_keys(table, row)?;
        let target = self.table_mut(table)?;
        let key = row
            .get(&target.key_column)
            .and_then(value_key)
            .ok_or_else(|| StorageError::other(format!("row for \"{}\" has no key", table)))?;

        let mut incoming = match row {
            Value::Object(map) => map.clone(),
            _ => return Err(StorageError::other("row must be a JSON object")),
        };
        incoming.remove(RECORD_OPERATION_COLUMN);

        if let (Some(columns), Some(Value::Object(existing))) = (update_columns, target.rows.get_mut(&key)) {
            let names = columns
                .iter()
                .map(SqlIdentifier::as_str)
                .chain([ENTITY_STATUS_COLUMN, RECORD_LAST_CHANGED_COLUMN]);
            for column in names {
                if let Some(value) = incoming.get(column) {
                    existing.insert(column.to_string(), value.clone());
                }
            }
            return Ok(());
        }
        target.rows.insert(key, Value::Object(incoming));
        Ok(())
    }

    fn mark_deleted(&mut self, table: &str, key: &str, at: &str) -> StorageResult<()> {
        let target = self.table_mut(table)?;
        if let Some(Value::Object(row)) = target.rows.get_mut(key) {
            let active = row.get(ENTITY_STATUS_COLUMN).and_then(Value::as_i64) != Some(0);
            if active {
                row.insert(ENTITY_STATUS_COLUMN.to_string(), Value::from(0));
                row.insert(RECORD_LAST_CHANGED_COLUMN.to_string(), Value::from(at));
            }
        }
        Ok(())
    }

    fn run_merge(&mut self, binding: &MergeBinding, soft_delete_absent: bool) -> StorageResult<()> {
        let rows = self.staging.get(&binding.staging).cloned().unwrap_or_default();
        let key_column = self.table(&binding.table)?.key_column.clone();
        let mut staged_keys = HashSet::new();

        for row in &rows {
            let key = row
                .get(&key_column)
                .and_then(value_key)
                .ok_or_else(|| StorageError::other("staging row has no key"))?;
            staged_keys.insert(key.clone());

            let is_delete = row.get(RECORD_OPERATION_COLUMN).and_then(Value::as_str) == Some("delete");
            if is_delete {
                let at = row
                    .get(RECORD_LAST_CHANGED_COLUMN)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Utc::now().to_rfc3339());
                self.mark_deleted(&binding.table, &key, &at)?;
            } else {
                self.write_row(&binding.table, row, None)?;
            }
        }

        if soft_delete_absent {
            let at = Utc::now().to_rfc3339();
            let absent: Vec<EntityKey> = self
                .table(&binding.table)?
                .rows
                .keys()
                .filter(|key| !staged_keys.contains(*key))
                .cloned()
                .collect();
            for key in absent {
                self.mark_deleted(&binding.table, &key, &at)?;
            }
        }

        self.merge_calls += 1;
        Ok(())
    }
}

fn value_key(value: &Value) -> Option<EntityKey> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

type Failures = Arc<DashMap<FailurePoint, VecDeque<StorageError>>>;

fn check(failures: &Failures, unavailable: &AtomicBool, point: FailurePoint) -> StorageResult<()> {
    if unavailable.load(Ordering::SeqCst) {
        return Err(StorageError::connectivity("connection refused"));
    }
    if let Some(mut queue) = failures.get_mut(&point) {
        if let Some(err) = queue.pop_front() {
            return Err(err);
        }
    }
    Ok(())
}

/// A process-local relational store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    failures: Failures,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a permanent table keyed by `key_column`.
    pub async fn create_table(&self, name: &str, key_column: &str) {
        self.state.lock().await.tables.insert(
            name.to_string(),
            MemoryTable {
                key_column: key_column.to_string(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Register a merge routine reconciling `staging` into `table`.
    pub async fn register_merge(&self, routine: &str, staging: &str, table: &str) {
        self.state.lock().await.merges.insert(
            routine.to_string(),
            MergeBinding {
                staging: staging.to_string(),
                table: table.to_string(),
            },
        );
    }

    /// Require `table.field` to reference an existing key of `parent_table`.
    pub async fn add_foreign_key(&self, name: &str, table: &str, field: &str, parent_table: &str) {
        self.state.lock().await.foreign_keys.push(ForeignKey {
            name: name.to_string(),
            table: table.to_string(),
            field: field.to_string(),
            parent_table: parent_table.to_string(),
        });
    }

    /// Write a row directly, bypassing staging.
    pub async fn insert_row(&self, table: &str, row: Value) -> StorageResult<()> {
        self.state.lock().await.write_row(table, &row, None)
    }

    /// All rows of a table, ordered by key.
    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .and_then(|t| t.rows.get(key).cloned())
    }

    pub async fn staging_rows(&self, staging: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .staging
            .get(staging)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of committed merge calls.
    pub async fn merge_calls(&self) -> usize {
        self.state.lock().await.merge_calls
    }

    pub async fn tracking(&self, service: &str) -> Option<ServiceTracking> {
        self.state.lock().await.tracking.get(service).cloned()
    }

    /// Make the next call at `point` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, point: FailurePoint, error: StorageError) {
        self.failures.entry(point).or_default().push_back(error);
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self, point: FailurePoint) -> StorageResult<()> {
        check(&self.failures, &self.unavailable, point)
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn begin(&self) -> StorageResult<Box<dyn UnitOfWork>> {
        self.check(FailurePoint::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        let original = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard: Some(guard),
            original: Some(original),
            failures: self.failures.clone(),
            unavailable: self.unavailable.clone(),
        }))
    }

    async fn ping(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::connectivity("connection refused"));
        }
        Ok(())
    }

    async fn load_tracking(&self) -> StorageResult<Vec<ServiceTracking>> {
        self.ping().await?;
        Ok(self.state.lock().await.tracking.values().cloned().collect())
    }

    async fn load_statuses(
        &self,
        table: &SqlIdentifier,
        key_column: &SqlIdentifier,
    ) -> StorageResult<HashMap<EntityKey, EntityStatus>> {
        self.ping().await?;
        let state = self.state.lock().await;
        let target = state.table(table.as_str())?;
        Ok(target
            .rows
            .values()
            .filter_map(|row| {
                let key = row.get(key_column.as_str()).and_then(value_key)?;
                let status = row
                    .get(ENTITY_STATUS_COLUMN)
                    .and_then(Value::as_i64)
                    .map_or(EntityStatus::Active, |s| EntityStatus::from_i32(s as i32));
                Some((key, status))
            })
            .collect())
    }
}

/// A unit of work over the in-memory store.
pub struct MemoryUnitOfWork {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    original: Option<MemoryState>,
    failures: Failures,
    unavailable: Arc<AtomicBool>,
}

impl MemoryUnitOfWork {
    fn state(&mut self, point: FailurePoint) -> StorageResult<&mut MemoryState> {
        check(&self.failures, &self.unavailable, point)?;
        self.guard
            .as_deref_mut()
            .ok_or_else(|| StorageError::other("unit of work already finished"))
    }

    fn restore(&mut self) {
        if let (Some(guard), Some(original)) = (self.guard.as_mut(), self.original.take()) {
            **guard = original;
        }
        self.guard = None;
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn truncate_staging(&mut self, staging: &SqlIdentifier) -> StorageResult<()> {
        let state = self.state(FailurePoint::TruncateStaging)?;
        state.staging.insert(staging.to_string(), Vec::new());
        Ok(())
    }

    async fn write_staging(&mut self, staging: &SqlIdentifier, rows: &[Value]) -> StorageResult<u64> {
        let state = self.state(FailurePoint::WriteStaging)?;
        state
            .staging
            .entry(staging.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn merge(&mut self, routine: &MergeRoutine, soft_delete_absent: bool) -> StorageResult<()> {
        let state = self.state(FailurePoint::Merge)?;
        let binding = state.merges.get(routine.name.as_str()).cloned().ok_or_else(|| {
            StorageError::other(format!("routine {} does not exist", routine.name))
        })?;
        state.run_merge(&binding, soft_delete_absent)
    }

    async fn upsert(&mut self, target: &UpsertTarget, row: &Value) -> StorageResult<()> {
        let state = self.state(FailurePoint::Upsert)?;
        state.write_row(target.table.as_str(), row, Some(&target.columns))
    }

    async fn soft_delete(
        &mut self,
        table: &SqlIdentifier,
        _key_column: &SqlIdentifier,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let state = self.state(FailurePoint::SoftDelete)?;
        state.mark_deleted(table.as_str(), key, &at.to_rfc3339())
    }

    async fn save_tracking(&mut self, tracking: &ServiceTracking) -> StorageResult<()> {
        let state = self.state(FailurePoint::SaveTracking)?;
        state
            .tracking
            .insert(tracking.service_id.clone(), tracking.clone());
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.state(FailurePoint::Commit)?;
        self.original = None;
        self.guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.restore();
        Ok(())
    }
}
