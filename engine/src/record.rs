//! Record types shared by the cache, reconciliation and persistence layers.

use crate::{error::Result, EntityKey, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column written alongside source fields to flag soft deletion.
pub const ENTITY_STATUS_COLUMN: &str = "entity_status";
/// Column carrying the time of the last status or content transition.
pub const RECORD_LAST_CHANGED_COLUMN: &str = "record_last_changed_utc";
/// Column telling the merge step how the row was classified.
pub const RECORD_OPERATION_COLUMN: &str = "record_operation";

/// Anything with a natural (source) key.
pub trait Keyed {
    /// The natural key of this record.
    fn key(&self) -> EntityKey;
}

/// Soft-delete flag stored with every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    /// Removed at the source
    Deleted,
    /// Present at the source
    Active,
}

impl EntityStatus {
    /// Database encoding (`1` active, `0` deleted).
    pub fn as_i32(self) -> i32 {
        match self {
            EntityStatus::Deleted => 0,
            EntityStatus::Active => 1,
        }
    }

    /// Decode the database encoding; anything non-zero is active.
    pub fn from_i32(value: i32) -> Self {
        if value == 0 {
            EntityStatus::Deleted
        } else {
            EntityStatus::Active
        }
    }
}

/// How a staged row relates to the permanent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOperation {
    /// Key not yet persisted
    Insert,
    /// Key already persisted, or repeated within the batch
    Update,
    /// Key must be soft-deleted
    Delete,
}

impl RecordOperation {
    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordOperation::Insert => "insert",
            RecordOperation::Update => "update",
            RecordOperation::Delete => "delete",
        }
    }
}

/// A transient row destined for a staging area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingRecord {
    /// Natural key
    pub key: EntityKey,
    /// Insert, update or delete
    pub operation: RecordOperation,
    /// Status the permanent row should end up with
    pub status: EntityStatus,
    /// Transition timestamp
    pub record_last_changed_utc: DateTime<Utc>,
    /// Source fields (a JSON object)
    pub payload: serde_json::Value,
}

impl StagingRecord {
    /// Build an active row from a source payload.
    pub fn upsert(
        key: impl Into<EntityKey>,
        operation: RecordOperation,
        payload: serde_json::Value,
        changed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let key = key.into();
        if !payload.is_object() {
            return Err(Error::InvalidPayload {
                key,
                reason: "payload must be a JSON object".into(),
            });
        }
        Ok(Self {
            key,
            operation,
            status: EntityStatus::Active,
            record_last_changed_utc: changed_at,
            payload,
        })
    }

    /// Build a soft-delete row carrying only the key column.
    pub fn delete(key: impl Into<EntityKey>, key_column: &str, changed_at: DateTime<Utc>) -> Self {
        let key = key.into();
        let mut payload = serde_json::Map::new();
        payload.insert(key_column.to_string(), serde_json::Value::String(key.clone()));
        Self {
            key,
            operation: RecordOperation::Delete,
            status: EntityStatus::Deleted,
            record_last_changed_utc: changed_at,
            payload: serde_json::Value::Object(payload),
        }
    }

    /// Flatten into the JSON object written to a staging table: the source
    /// fields plus the status, change timestamp and operation columns.
    pub fn to_row(&self) -> serde_json::Value {
        let mut row = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        row.insert(
            ENTITY_STATUS_COLUMN.to_string(),
            serde_json::Value::from(self.status.as_i32()),
        );
        row.insert(
            RECORD_LAST_CHANGED_COLUMN.to_string(),
            serde_json::Value::String(self.record_last_changed_utc.to_rfc3339()),
        );
        row.insert(
            RECORD_OPERATION_COLUMN.to_string(),
            serde_json::Value::String(self.operation.as_str().to_string()),
        );
        serde_json::Value::Object(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn status_encoding() {
        assert_eq!(EntityStatus::Active.as_i32(), 1);
        assert_eq!(EntityStatus::Deleted.as_i32(), 0);
        assert_eq!(EntityStatus::from_i32(0), EntityStatus::Deleted);
        assert_eq!(EntityStatus::from_i32(7), EntityStatus::Active);
    }

    #[test]
    fn upsert_requires_object_payload() {
        let err = StagingRecord::upsert("b1", RecordOperation::Insert, json!([1, 2]), now()).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[test]
    fn row_carries_bookkeeping_columns() {
        let record = StagingRecord::upsert(
            "b1",
            RecordOperation::Insert,
            json!({"id": "b1", "name": "Truck 7"}),
            now(),
        )
        .unwrap();

        let row = record.to_row();
        assert_eq!(row["id"], "b1");
        assert_eq!(row["name"], "Truck 7");
        assert_eq!(row[ENTITY_STATUS_COLUMN], 1);
        assert_eq!(row[RECORD_OPERATION_COLUMN], "insert");
        assert!(row[RECORD_LAST_CHANGED_COLUMN].as_str().unwrap().starts_with("2023-11-14"));
    }

    #[test]
    fn delete_row_has_only_key() {
        let record = StagingRecord::delete("b9", "id", now());
        assert_eq!(record.status, EntityStatus::Deleted);

        let row = record.to_row();
        assert_eq!(row["id"], "b9");
        assert_eq!(row[ENTITY_STATUS_COLUMN], 0);
        assert_eq!(row[RECORD_OPERATION_COLUMN], "delete");
        assert_eq!(row.as_object().unwrap().len(), 4);
    }
}
