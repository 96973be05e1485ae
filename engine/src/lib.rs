//! # Feedsync Engine
//!
//! The deterministic core of an entity synchronization service that pulls
//! records from a remote versioned source and keeps a relational store in
//! line with it.
//!
//! Nothing in this crate performs IO. Every type here is a plain value that
//! the server crate drives from its async loops, which keeps the hard parts
//! (cursor monotonicity, reconciliation, scheduling) testable without a
//! database or a network.
//!
//! ## Core Concepts
//!
//! ### Feed cursors
//!
//! Transactional entities arrive through an ordered, versioned feed. A
//! [`SyncCursor`] separates the *fetched* position from the *processed*
//! (durably committed) one, and [`FeedState`] adds buffering, page sizing and
//! poll pacing on top. After a failed commit the reader rolls back to the
//! processed position, so no record is skipped.
//!
//! ### Reference caches
//!
//! Reference entities are mirrored into a [`CacheSnapshot`]. A
//! [`CacheSchedule`] decides between incremental updates and full Refreshes
//! anchored to a daily reference time. Only a Refresh can prove that a key
//! disappeared at the source.
//!
//! ### Reconciliation and staging
//!
//! The [`Reconciler`] diffs a snapshot against the persisted keys and
//! produces a [`StagingBatch`] of insert, update and soft-delete rows. Rows
//! are never hard-deleted; [`EntityStatus`] flags them instead.
//!
//! ### Dependencies and process state
//!
//! A [`ServiceDependency`] maps violated foreign-key constraints to the
//! service that produces the parent rows. [`ProcessStatus`] is the
//! process-wide connectivity state every loop consults before doing work.
//!
//! ## Quick Start
//!
//! ```rust
//! use feedsync_engine::{CacheSnapshot, EntityKey, EntityStatus, Keyed, Reconciler};
//! use chrono::Utc;
//! use serde::Serialize;
//! use std::collections::HashMap;
//!
//! #[derive(Clone, PartialEq, Serialize)]
//! struct Device {
//!     id: String,
//!     name: String,
//! }
//!
//! impl Keyed for Device {
//!     fn key(&self) -> EntityKey {
//!         self.id.clone()
//!     }
//! }
//!
//! let mut snapshot = CacheSnapshot::new();
//! snapshot.apply_refresh(
//!     vec![Device { id: "b1".into(), name: "Truck".into() }],
//!     Utc::now(),
//! );
//!
//! let mut persisted = HashMap::new();
//! persisted.insert("b2".to_string(), EntityStatus::Active);
//!
//! let result = Reconciler::new("id", &persisted)
//!     .reconcile(&snapshot, Utc::now())
//!     .unwrap();
//! assert_eq!(result.inserted, vec!["b1".to_string()]);
//! assert_eq!(result.deleted, vec!["b2".to_string()]);
//! ```

pub mod cursor;
pub mod dependency;
pub mod error;
pub mod feed;
pub mod identifier;
pub mod reconcile;
pub mod record;
pub mod schedule;
pub mod snapshot;
pub mod staging;
pub mod state;

// Re-export main types at crate root
pub use cursor::{FeedVersion, SyncCursor};
pub use dependency::{DependencyResolution, ServiceDependency};
pub use error::Error;
pub use feed::{FeedBatch, FeedState};
pub use identifier::SqlIdentifier;
pub use reconcile::{ReconcileResult, Reconciler};
pub use record::{
    EntityStatus, Keyed, RecordOperation, StagingRecord, ENTITY_STATUS_COLUMN,
    RECORD_LAST_CHANGED_COLUMN, RECORD_OPERATION_COLUMN,
};
pub use schedule::CacheSchedule;
pub use snapshot::{CacheOperationType, CacheSnapshot};
pub use staging::{BatchCounts, StagingBatch};
pub use state::{FailureKind, ProcessState, ProcessStatus, WaitReason};

/// Type aliases for clarity
pub type ServiceId = String;
pub type EntityKey = String;
