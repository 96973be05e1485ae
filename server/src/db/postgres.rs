//! PostgreSQL backend.
//!
//! Staging writes and direct upserts go through `jsonb_populate_record[set]`
//! so any table whose columns match the payload fields works without
//! per-entity SQL. Identifiers are spliced in as text; they are validated by
//! [`SqlIdentifier`] when the service file is loaded.

use super::backend::{PersistenceBackend, StorageResult, UnitOfWork};
use super::pool::Pool;
use crate::config::{MergeKind, MergeRoutine, UpsertTarget};
use crate::error::{StorageError, StorageErrorKind};
use crate::tracking::ServiceTracking;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_engine::{
    EntityKey, EntityStatus, FeedVersion, SqlIdentifier, ENTITY_STATUS_COLUMN,
    RECORD_LAST_CHANGED_COLUMN,
};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;

/// Classify a driver error by SQLSTATE.
pub fn classify_pg(err: &sqlx::Error) -> StorageError {
    let kind = match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            classify_code(code.as_deref(), db.constraint(), db.message())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageErrorKind::Connectivity,
        _ => StorageErrorKind::Other,
    };
    StorageError::new(kind, err.to_string())
}

/// SQLSTATE code map.
pub fn classify_code(code: Option<&str>, constraint: Option<&str>, message: &str) -> StorageErrorKind {
    match code {
        Some("23503") => StorageErrorKind::ForeignKey {
            constraint: constraint
                .map(str::to_string)
                .or_else(|| constraint_from_message(message)),
        },
        Some(code) if code.starts_with("08") => StorageErrorKind::Connectivity,
        Some("57P01" | "57P02" | "57P03" | "53300") => StorageErrorKind::Connectivity,
        Some("40001" | "40P01" | "55P03") => StorageErrorKind::Transient,
        _ => StorageErrorKind::Other,
    }
}

/// Fallback for drivers that omit the structured constraint field.
fn constraint_from_message(message: &str) -> Option<String> {
    const MARKER: &str = "violates foreign key constraint \"";
    let start = message.find(MARKER)? + MARKER.len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string()).filter(|name| !name.is_empty())
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        classify_pg(&err)
    }
}

fn merge_sql(routine: &MergeRoutine) -> String {
    match routine.kind {
        MergeKind::Function => format!("SELECT {}($1)", routine.name),
        MergeKind::Procedure => format!("CALL {}($1)", routine.name),
    }
}

fn upsert_sql(target: &UpsertTarget) -> String {
    let mut columns: Vec<&str> = target.columns.iter().map(SqlIdentifier::as_str).collect();
    for bookkeeping in [ENTITY_STATUS_COLUMN, RECORD_LAST_CHANGED_COLUMN] {
        if !columns.contains(&bookkeeping) {
            columns.push(bookkeeping);
        }
    }
    let excluded: Vec<String> = columns.iter().map(|c| format!("EXCLUDED.{}", c)).collect();
    format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
         ON CONFLICT ({key}) DO UPDATE SET ({columns}) = ROW({excluded})",
        table = target.table,
        key = target.key_column,
        columns = columns.join(", "),
        excluded = excluded.join(", "),
    )
}

/// Backend over a sqlx connection pool.
#[derive(Clone)]
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceBackend for PgBackend {
    async fn begin(&self) -> StorageResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_tracking(&self) -> StorageResult<Vec<ServiceTracking>> {
        let rows = sqlx::query(
            r#"
            SELECT service_id, adapter_version, machine_name, entities_last_processed_utc,
                   last_processed_feed_version, last_feed_retrieval_time_utc, record_last_changed_utc
            FROM service_tracking
            ORDER BY service_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ServiceTracking, sqlx::Error> {
                Ok(ServiceTracking {
                    service_id: row.try_get("service_id")?,
                    adapter_version: row.try_get("adapter_version")?,
                    machine_name: row.try_get("machine_name")?,
                    entities_last_processed_utc: row.try_get("entities_last_processed_utc")?,
                    last_processed_feed_version: row
                        .try_get::<Option<i64>, _>("last_processed_feed_version")?
                        .map(FeedVersion::new),
                    last_feed_retrieval_time_utc: row.try_get("last_feed_retrieval_time_utc")?,
                    record_last_changed_utc: row.try_get("record_last_changed_utc")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    async fn load_statuses(
        &self,
        table: &SqlIdentifier,
        key_column: &SqlIdentifier,
    ) -> StorageResult<HashMap<EntityKey, EntityStatus>> {
        let sql = format!(
            "SELECT {key}::text AS key, {status}::int4 AS status FROM {table}",
            key = key_column,
            status = ENTITY_STATUS_COLUMN,
            table = table,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let status: i32 = row.try_get("status")?;
            statuses.insert(key, EntityStatus::from_i32(status));
        }
        Ok(statuses)
    }
}

/// A unit of work backed by one database transaction.
pub struct PgUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> StorageResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| StorageError::other("unit of work already finished"))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn truncate_staging(&mut self, staging: &SqlIdentifier) -> StorageResult<()> {
        let sql = format!("TRUNCATE TABLE {}", staging);
        sqlx::query(&sql).execute(&mut **self.tx()?).await?;
        Ok(())
    }

    async fn write_staging(
        &mut self,
        staging: &SqlIdentifier,
        rows: &[serde_json::Value],
    ) -> StorageResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {staging} SELECT * FROM jsonb_populate_recordset(NULL::{staging}, $1)",
            staging = staging
        );
        let result = sqlx::query(&sql)
            .bind(serde_json::Value::Array(rows.to_vec()))
            .execute(&mut **self.tx()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn merge(&mut self, routine: &MergeRoutine, soft_delete_absent: bool) -> StorageResult<()> {
        sqlx::query(&merge_sql(routine))
            .bind(soft_delete_absent)
            .execute(&mut **self.tx()?)
            .await?;
        Ok(())
    }

    async fn upsert(&mut self, target: &UpsertTarget, row: &serde_json::Value) -> StorageResult<()> {
        sqlx::query(&upsert_sql(target))
            .bind(row)
            .execute(&mut **self.tx()?)
            .await?;
        Ok(())
    }

    async fn soft_delete(
        &mut self,
        table: &SqlIdentifier,
        key_column: &SqlIdentifier,
        key: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let sql = format!(
            "UPDATE {table} SET {status} = 0, {changed} = $2 WHERE {key}::text = $1 AND {status} <> 0",
            table = table,
            status = ENTITY_STATUS_COLUMN,
            changed = RECORD_LAST_CHANGED_COLUMN,
            key = key_column,
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(at)
            .execute(&mut **self.tx()?)
            .await?;
        Ok(())
    }

    async fn save_tracking(&mut self, tracking: &ServiceTracking) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_tracking (
                service_id, adapter_version, machine_name, entities_last_processed_utc,
                last_processed_feed_version, last_feed_retrieval_time_utc, record_last_changed_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (service_id) DO UPDATE SET
                adapter_version = EXCLUDED.adapter_version,
                machine_name = EXCLUDED.machine_name,
                entities_last_processed_utc = EXCLUDED.entities_last_processed_utc,
                last_processed_feed_version = EXCLUDED.last_processed_feed_version,
                last_feed_retrieval_time_utc = EXCLUDED.last_feed_retrieval_time_utc,
                record_last_changed_utc = EXCLUDED.record_last_changed_utc
            "#,
        )
        .bind(&tracking.service_id)
        .bind(&tracking.adapter_version)
        .bind(&tracking.machine_name)
        .bind(tracking.entities_last_processed_utc)
        .bind(tracking.last_processed_feed_version.map(FeedVersion::get))
        .bind(tracking.last_feed_retrieval_time_utc)
        .bind(tracking.record_last_changed_utc)
        .execute(&mut **self.tx()?)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(StorageError::other("unit of work already finished")),
        }
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}
