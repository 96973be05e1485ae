//! Configuration management for the sync service.
//!
//! Process settings come from environment variables. Per-service settings are
//! plain data in a JSON file of [`ServiceDescriptor`] values.

use chrono::NaiveTime;
use feedsync_engine::{CacheSchedule, ServiceDependency, ServiceId, SqlIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Status endpoint host address
    pub host: String,
    /// Status endpoint port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Connection pool size
    pub database_max_connections: u32,
    /// Base URL of the remote feed service
    pub source_url: String,
    /// Path of the service descriptor file
    pub services_file: PathBuf,
    /// Re-poll tick of every awaiter wait
    pub wait_tick: Duration,
    /// Delay between connectivity probes and after a connectivity failure
    pub connectivity_retry: Duration,
    /// Attempts per batch on transient database errors
    pub persist_max_attempts: u32,
    /// Recorded with every tracking row
    pub machine_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;
        let source_url = lookup("FEEDSYNC_SOURCE_URL").ok_or(ConfigError::MissingSourceUrl)?;

        let services_file = lookup("FEEDSYNC_SERVICES_FILE")
            .unwrap_or_else(|| "services.json".to_string())
            .into();

        let database_max_connections: u32 = parse_number(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?;
        let wait_tick_ms: u64 = parse_number(&lookup, "FEEDSYNC_WAIT_TICK_MS", 1000)?;
        let retry_secs: u64 = parse_number(&lookup, "FEEDSYNC_CONNECTIVITY_RETRY_SECS", 20)?;
        let persist_max_attempts: u32 = parse_number(&lookup, "FEEDSYNC_PERSIST_MAX_ATTEMPTS", 3)?;

        let machine_name = lookup("FEEDSYNC_MACHINE_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            host,
            port,
            database_url,
            database_max_connections,
            source_url,
            services_file,
            wait_tick: Duration::from_millis(wait_tick_ms.max(1)),
            connectivity_retry: Duration::from_secs(retry_secs),
            persist_max_attempts: persist_max_attempts.max(1),
            machine_name,
        })
    }
}

fn parse_number<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

/// How a service reads from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Incremental, cursor-based feed
    Feed(FeedMode),
    /// Full-population reference cache
    Cache(CacheMode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMode {
    pub poll_interval_secs: u64,
    pub page_limit: usize,
    /// Lower page size for a table that cannot take full pages in one
    /// unit of work
    #[serde(default)]
    pub sink_page_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMode {
    /// Anchor of the daily refresh, e.g. `"02:00:00"` (UTC)
    pub daily_refresh_reference_time: NaiveTime,
    pub update_interval_minutes: u32,
    pub refresh_interval_minutes: u32,
    pub page_limit: usize,
    #[serde(default = "default_true")]
    pub fetch_all_pages: bool,
    /// Permanent table compared against the cache
    pub table: SqlIdentifier,
    /// Column holding the natural key in `table`
    pub key_column: SqlIdentifier,
}

fn default_true() -> bool {
    true
}

/// Dialect of a merge routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Invoked with `SELECT name($1)`
    Function,
    /// Invoked with `CALL name($1)`
    Procedure,
}

/// Set-based merge invoked by name after each staging write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRoutine {
    pub name: SqlIdentifier,
    pub kind: MergeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTarget {
    pub staging_table: SqlIdentifier,
    pub merge: MergeRoutine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertTarget {
    pub table: SqlIdentifier,
    pub key_column: SqlIdentifier,
    /// Columns overwritten on conflict
    pub columns: Vec<SqlIdentifier>,
}

/// How a batch reaches the permanent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStrategy {
    StagingMerge(StagingTarget),
    DirectUpsert(UpsertTarget),
}

/// Everything one sync loop needs to know about its entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_id: ServiceId,
    /// Entity type name used in source requests
    pub entity_type: String,
    /// Services that must have started before this one runs
    #[serde(default)]
    pub prerequisites: Vec<ServiceId>,
    #[serde(default)]
    pub pause_for_maintenance: bool,
    /// Violated constraint → producing service
    #[serde(default)]
    pub dependencies: ServiceDependency,
    pub mode: SyncMode,
    pub persistence: PersistenceStrategy,
}

impl ServiceDescriptor {
    /// Column the natural key is written to.
    pub fn key_column(&self) -> &str {
        match (&self.mode, &self.persistence) {
            (SyncMode::Cache(cache), _) => cache.key_column.as_str(),
            (_, PersistenceStrategy::DirectUpsert(target)) => target.key_column.as_str(),
            _ => "id",
        }
    }

    /// Check the values serde cannot check on its own.
    fn validate(&self, known: &HashSet<&str>) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidService {
            service: self.service_id.clone(),
            reason,
        };

        if self.entity_type.trim().is_empty() {
            return Err(invalid("entity_type must not be empty".into()));
        }

        match &self.mode {
            SyncMode::Feed(feed) => {
                if feed.page_limit == 0 {
                    return Err(invalid("page_limit must be at least 1".into()));
                }
                if feed.sink_page_limit == Some(0) {
                    return Err(invalid("sink_page_limit must be at least 1".into()));
                }
            }
            SyncMode::Cache(cache) => {
                if cache.page_limit == 0 {
                    return Err(invalid("page_limit must be at least 1".into()));
                }
                CacheSchedule::new(
                    cache.daily_refresh_reference_time,
                    cache.update_interval_minutes,
                    cache.refresh_interval_minutes,
                )
                .map_err(|e| invalid(e.to_string()))?;
            }
        }

        if let PersistenceStrategy::DirectUpsert(target) = &self.persistence {
            if target.columns.is_empty() {
                return Err(invalid("direct_upsert needs at least one column".into()));
            }
        }

        for prerequisite in &self.prerequisites {
            if prerequisite == &self.service_id {
                return Err(invalid("a service cannot be its own prerequisite".into()));
            }
            if !known.contains(prerequisite.as_str()) {
                return Err(invalid(format!("unknown prerequisite {}", prerequisite)));
            }
        }

        self.dependencies
            .validate(&self.service_id)
            .map_err(|e| invalid(e.to_string()))?;
        for producer in self.dependencies.producers() {
            if !known.contains(producer.as_str()) {
                return Err(invalid(format!("unknown producing service {}", producer)));
            }
        }

        Ok(())
    }
}

/// Parse and validate a list of service descriptors.
pub fn parse_services(json: &str) -> Result<Vec<ServiceDescriptor>, ConfigError> {
    let services: Vec<ServiceDescriptor> = serde_json::from_str(json)?;

    let mut known = HashSet::new();
    for service in &services {
        if !known.insert(service.service_id.as_str()) {
            return Err(ConfigError::DuplicateService(service.service_id.clone()));
        }
    }
    for service in &services {
        service.validate(&known)?;
    }

    Ok(services)
}

/// Read, parse and validate the service descriptor file.
pub fn load_services(path: &Path) -> Result<Vec<ServiceDescriptor>, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::ServicesFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_services(&json)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("FEEDSYNC_SOURCE_URL environment variable is required")]
    MissingSourceUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value {value:?} for {var}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Cannot read services file {path:?}: {source}")]
    ServicesFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid services file: {0}")]
    ServicesParse(#[from] serde_json::Error),

    #[error("Service {0} is declared more than once")]
    DuplicateService(ServiceId),

    #[error("Invalid service {service}: {reason}")]
    InvalidService { service: ServiceId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const SERVICES: &str = r#"[
        {
            "service_id": "DeviceService",
            "entity_type": "Device",
            "pause_for_maintenance": true,
            "mode": {"cache": {
                "daily_refresh_reference_time": "02:00:00",
                "update_interval_minutes": 5,
                "refresh_interval_minutes": 1440,
                "page_limit": 5000,
                "table": "devices",
                "key_column": "id"
            }},
            "persistence": {"direct_upsert": {
                "table": "devices",
                "key_column": "id",
                "columns": ["name", "serial_number"]
            }}
        },
        {
            "service_id": "LogRecordService",
            "entity_type": "LogRecord",
            "prerequisites": ["DeviceService"],
            "dependencies": {"FK_LogRecords_Devices": "DeviceService"},
            "mode": {"feed": {"poll_interval_secs": 30, "page_limit": 50000, "sink_page_limit": 5000}},
            "persistence": {"staging_merge": {
                "staging_table": "stg_log_records",
                "merge": {"name": "merge_stg_log_records", "kind": "procedure"}
            }}
        }
    ]"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/feedsync"),
            ("FEEDSYNC_SOURCE_URL", "http://localhost:8080"),
        ]))
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.services_file, PathBuf::from("services.json"));
        assert_eq!(config.wait_tick, Duration::from_secs(1));
        assert_eq!(config.connectivity_retry, Duration::from_secs(20));
        assert_eq!(config.persist_max_attempts, 3);
        assert_eq!(config.machine_name, "unknown");
    }

    #[test]
    fn test_machine_name_falls_back_to_hostname() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/feedsync"),
            ("FEEDSYNC_SOURCE_URL", "http://localhost:8080"),
            ("HOSTNAME", "sync-01"),
        ]))
        .unwrap();
        assert_eq!(config.machine_name, "sync-01");
    }

    #[test]
    fn test_missing_and_invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::MissingDatabaseUrl)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])),
            Err(ConfigError::MissingSourceUrl)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://x"),
                ("FEEDSYNC_SOURCE_URL", "http://x"),
                ("FEEDSYNC_WAIT_TICK_MS", "soon"),
            ])),
            Err(ConfigError::InvalidNumber {
                var: "FEEDSYNC_WAIT_TICK_MS",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_services() {
        let services = parse_services(SERVICES).unwrap();
        assert_eq!(services.len(), 2);

        let devices = &services[0];
        assert!(devices.pause_for_maintenance);
        assert!(matches!(&devices.mode, SyncMode::Cache(c) if c.fetch_all_pages));
        assert_eq!(devices.key_column(), "id");

        let logs = &services[1];
        assert!(matches!(&logs.mode, SyncMode::Feed(f) if f.sink_page_limit == Some(5000)));
        assert_eq!(logs.prerequisites, vec!["DeviceService".to_string()]);
        assert_eq!(
            logs.dependencies
                .producer_for("fk_logrecords_devices")
                .map(String::as_str),
            Some("DeviceService")
        );
        match &logs.persistence {
            PersistenceStrategy::StagingMerge(target) => {
                assert_eq!(target.merge.kind, MergeKind::Procedure);
                assert_eq!(target.staging_table.as_str(), "stg_log_records");
            }
            other => panic!("unexpected persistence {:?}", other),
        }
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let json = SERVICES.replace("\"prerequisites\": [\"DeviceService\"]", "\"prerequisites\": [\"ZoneService\"]");
        assert!(matches!(
            parse_services(&json),
            Err(ConfigError::InvalidService { reason, .. }) if reason.contains("ZoneService")
        ));
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let json = SERVICES.replace("stg_log_records\"", "stg_log_records; drop table x\"");
        assert!(matches!(parse_services(&json), Err(ConfigError::ServicesParse(_))));
    }

    #[test]
    fn test_zero_page_limit_rejected() {
        let json = SERVICES.replace("\"page_limit\": 50000", "\"page_limit\": 0");
        assert!(matches!(
            parse_services(&json),
            Err(ConfigError::InvalidService { service, .. }) if service == "LogRecordService"
        ));
    }

    #[test]
    fn test_zero_sink_page_limit_rejected() {
        let json = SERVICES.replace("\"sink_page_limit\": 5000", "\"sink_page_limit\": 0");
        assert!(matches!(
            parse_services(&json),
            Err(ConfigError::InvalidService { reason, .. }) if reason.contains("sink_page_limit")
        ));

        let json = SERVICES.replace(", \"sink_page_limit\": 5000", "");
        let services = parse_services(&json).unwrap();
        assert!(matches!(&services[1].mode, SyncMode::Feed(f) if f.sink_page_limit.is_none()));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let json = SERVICES.replace("LogRecordService", "DeviceService");
        assert!(matches!(
            parse_services(&json),
            Err(ConfigError::DuplicateService(id)) if id == "DeviceService"
        ));
    }
}
