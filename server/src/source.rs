//! Remote source abstraction.

use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_engine::{EntityKey, FeedBatch, FeedVersion, Keyed};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw source record: its natural key plus every other field as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: EntityKey,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<EntityKey>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { id: id.into(), fields }
    }

    /// Copy the natural key into `key_column` when the target table names
    /// its key something other than `id`.
    pub fn keyed_as(mut self, key_column: &str) -> Self {
        if key_column != "id" {
            self.fields
                .insert(key_column.to_string(), Value::String(self.id.clone()));
        }
        self
    }
}

impl Keyed for SourceRecord {
    fn key(&self) -> EntityKey {
        self.id.clone()
    }
}

/// One page of a full or filtered enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPage {
    #[serde(rename = "data")]
    pub records: Vec<SourceRecord>,
    /// Token of the following page; `None` on the last page
    #[serde(default)]
    pub next_page: Option<String>,
}

/// Cursor-based change feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Records after `from_version` (from the start of the feed if `None`),
    /// at most `limit` of them, plus the new cursor token.
    async fn fetch_feed(
        &self,
        entity_type: &str,
        from_version: Option<FeedVersion>,
        limit: usize,
    ) -> Result<FeedBatch<SourceRecord>, SourceError>;
}

/// Paged enumeration of a reference entity population.
#[async_trait]
pub trait CacheSource: Send + Sync {
    /// One page of records, optionally only those changed since
    /// `changed_since`.
    async fn fetch_page(
        &self,
        entity_type: &str,
        changed_since: Option<DateTime<Utc>>,
        page: Option<&str>,
        limit: usize,
    ) -> Result<EntityPage, SourceError>;
}

/// Reachability check used by the connectivity probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> Result<(), SourceError>;
}
