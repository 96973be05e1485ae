//! Scripted sources and wiring shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_engine::{FeedBatch, FeedVersion, SqlIdentifier};
use feedsync_server::awaiter::{BackendProbe, BackgroundAwaiter};
use feedsync_server::config::{MergeKind, MergeRoutine, PersistenceStrategy, StagingTarget, UpsertTarget};
use feedsync_server::coordinator::DependencyCoordinator;
use feedsync_server::db::MemoryBackend;
use feedsync_server::error::SourceError;
use feedsync_server::source::{CacheSource, EntityPage, FeedSource, HealthCheck, SourceRecord};
use feedsync_server::state_machine::StateMachine;
use feedsync_server::tracking::ServiceTracker;
use feedsync_server::worker::Clock;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ident(name: &str) -> SqlIdentifier {
    SqlIdentifier::new(name).unwrap()
}

pub fn record(id: &str, fields: Value) -> SourceRecord {
    SourceRecord::new(id, fields)
}

/// Wall clock that a test can move forward.
#[derive(Default)]
pub struct TestClock {
    offset_secs: AtomicI64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.offset_secs.fetch_add(by.num_seconds(), Ordering::SeqCst);
    }

    pub fn clock(self: &Arc<Self>) -> Clock {
        let this = self.clone();
        Arc::new(move || Utc::now() + chrono::Duration::seconds(this.offset_secs.load(Ordering::SeqCst)))
    }
}

/// A change log: every appended record gets the next version.
#[derive(Default)]
pub struct ScriptedFeed {
    log: Mutex<Vec<(i64, SourceRecord)>>,
    failures: Mutex<VecDeque<SourceError>>,
    requests: Mutex<Vec<(Option<i64>, usize)>>,
    down: AtomicBool,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, record: SourceRecord) -> i64 {
        let mut log = self.log.lock().unwrap();
        let version = log.last().map_or(1, |(v, _)| v + 1);
        log.push((version, record));
        version
    }

    /// Append records with versions starting right after `after`.
    pub fn push_from(&self, after: i64, records: impl IntoIterator<Item = SourceRecord>) {
        let mut log = self.log.lock().unwrap();
        for (offset, record) in records.into_iter().enumerate() {
            log.push((after + 1 + offset as i64, record));
        }
    }

    pub fn fail_next(&self, error: SourceError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    /// `(fromVersion, resultsLimit)` of every request so far.
    pub fn requests(&self) -> Vec<(Option<i64>, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch_feed(
        &self,
        _entity_type: &str,
        from_version: Option<FeedVersion>,
        limit: usize,
    ) -> Result<FeedBatch<SourceRecord>, SourceError> {
        let from = from_version.map(|v| v.get());
        self.requests.lock().unwrap().push((from, limit));
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("connection refused".into()));
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let log = self.log.lock().unwrap();
        let page: Vec<&(i64, SourceRecord)> = log
            .iter()
            .filter(|(v, _)| from.map_or(true, |from| *v > from))
            .take(limit)
            .collect();
        let to_version = page.last().map(|(v, _)| *v).or(from).unwrap_or(0);
        Ok(FeedBatch::new(
            page.into_iter().map(|(_, r)| r.clone()).collect(),
            FeedVersion::new(to_version),
        ))
    }
}

#[async_trait]
impl HealthCheck for ScriptedFeed {
    async fn health(&self) -> Result<(), SourceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

/// A reference population with change timestamps.
#[derive(Default)]
pub struct ScriptedCache {
    records: Mutex<BTreeMap<String, (SourceRecord, DateTime<Utc>)>>,
}

impl ScriptedCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert(&self, record: SourceRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), (record, Utc::now()));
    }

    pub fn remove(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl CacheSource for ScriptedCache {
    async fn fetch_page(
        &self,
        _entity_type: &str,
        changed_since: Option<DateTime<Utc>>,
        page: Option<&str>,
        limit: usize,
    ) -> Result<EntityPage, SourceError> {
        let offset = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::Protocol(format!("bad page token {}", token)))?,
            None => 0,
        };
        let matching: Vec<SourceRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|(_, changed)| changed_since.map_or(true, |since| *changed >= since))
            .map(|(r, _)| r.clone())
            .collect();

        let records: Vec<SourceRecord> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + records.len();
        Ok(EntityPage {
            records,
            next_page: (next < matching.len()).then(|| next.to_string()),
        })
    }
}

/// Shared state, probe, awaiter and coordinator over `backend` and `feed`.
pub struct Harness {
    pub backend: MemoryBackend,
    pub state: Arc<StateMachine>,
    pub tracker: Arc<ServiceTracker>,
    pub awaiter: Arc<BackgroundAwaiter>,
    pub coordinator: Arc<DependencyCoordinator>,
}

impl Harness {
    pub fn new(backend: MemoryBackend, health: Arc<dyn HealthCheck>) -> Self {
        let state = StateMachine::new_shared();
        let tracker = ServiceTracker::new_shared("test-host");
        let awaiter = Arc::new(BackgroundAwaiter::new(
            state.clone(),
            tracker.clone(),
            Arc::new(BackendProbe::new(Arc::new(backend.clone()), health)),
            Duration::from_millis(5),
            Duration::from_millis(20),
        ));
        let coordinator = Arc::new(DependencyCoordinator::new(tracker.clone(), Duration::from_millis(5)));
        Self {
            backend,
            state,
            tracker,
            awaiter,
            coordinator,
        }
    }
}

/// `log_records` fed through `stg_log_records`, with an optional foreign
/// key on `device_id` → `devices`.
pub async fn log_records_backend(with_foreign_key: bool) -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.create_table("devices", "id").await;
    backend.create_table("log_records", "id").await;
    backend
        .register_merge("merge_log_records", "stg_log_records", "log_records")
        .await;
    if with_foreign_key {
        backend
            .add_foreign_key("fk_log_records_devices", "log_records", "device_id", "devices")
            .await;
    }
    backend
}

pub fn log_records_strategy() -> PersistenceStrategy {
    PersistenceStrategy::StagingMerge(StagingTarget {
        staging_table: ident("stg_log_records"),
        merge: MergeRoutine {
            name: ident("merge_log_records"),
            kind: MergeKind::Procedure,
        },
    })
}

pub fn devices_upsert_strategy() -> PersistenceStrategy {
    PersistenceStrategy::DirectUpsert(UpsertTarget {
        table: ident("devices"),
        key_column: ident("id"),
        columns: vec![ident("name")],
    })
}

/// Wait until `check` holds, polling every few milliseconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
