//! Persistence abstraction shared by the PostgreSQL and in-memory backends.

use crate::config::{MergeRoutine, UpsertTarget};
use crate::error::StorageError;
use crate::tracking::ServiceTracking;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_engine::{EntityKey, EntityStatus, SqlIdentifier};
use std::collections::HashMap;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A relational store the sync loops write into.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Open a unit of work. Everything done through it commits or rolls back
    /// together.
    async fn begin(&self) -> StorageResult<Box<dyn UnitOfWork>>;

    /// Cheap round trip used by the connectivity probe.
    async fn ping(&self) -> StorageResult<()>;

    /// All durable tracking rows.
    async fn load_tracking(&self) -> StorageResult<Vec<ServiceTracking>>;

    /// Natural key → status of every row in `table`.
    async fn load_statuses(
        &self,
        table: &SqlIdentifier,
        key_column: &SqlIdentifier,
    ) -> StorageResult<HashMap<EntityKey, EntityStatus>>;
}

/// One transaction.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] discards
/// its changes.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Empty a staging area.
    async fn truncate_staging(&mut self, staging: &SqlIdentifier) -> StorageResult<()>;

    /// Append rows (JSON objects) to a staging area. Returns the row count.
    async fn write_staging(
        &mut self,
        staging: &SqlIdentifier,
        rows: &[serde_json::Value],
    ) -> StorageResult<u64>;

    /// Run a merge routine. `soft_delete_absent` asks it to flag permanent
    /// rows missing from the staging area as Deleted.
    async fn merge(&mut self, routine: &MergeRoutine, soft_delete_absent: bool) -> StorageResult<()>;

    /// Insert or update one row of the target table.
    async fn upsert(&mut self, target: &UpsertTarget, row: &serde_json::Value) -> StorageResult<()>;

    /// Flag one row Deleted. Rows already Deleted keep their timestamp.
    async fn soft_delete(
        &mut self,
        table: &SqlIdentifier,
        key_column: &SqlIdentifier,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Insert or replace a service's tracking row.
    async fn save_tracking(&mut self, tracking: &ServiceTracking) -> StorageResult<()>;

    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;
}
