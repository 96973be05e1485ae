//! Unified error handling for the sync service.
//!
//! Backends and sources report failures as tagged kinds. The runner only ever
//! looks at [`SyncError::failure_kind`] to decide between waiting, resolving a
//! dependency and terminating.

use crate::config::ConfigError;
use feedsync_engine::{FailureKind, WaitReason};
use std::fmt;

/// Backend-neutral classification of a storage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The store cannot be reached
    Connectivity,
    /// A foreign-key constraint rejected a row
    ForeignKey { constraint: Option<String> },
    /// Serialization failure, deadlock or lock timeout; worth retrying
    Transient,
    /// Anything else
    Other,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::Connectivity => write!(f, "connectivity"),
            StorageErrorKind::ForeignKey {
                constraint: Some(name),
            } => write!(f, "foreign key violation ({})", name),
            StorageErrorKind::ForeignKey { constraint: None } => write!(f, "foreign key violation"),
            StorageErrorKind::Transient => write!(f, "transient"),
            StorageErrorKind::Other => write!(f, "other"),
        }
    }
}

/// A classified storage failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Storage error [{kind}]: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Connectivity, message)
    }

    pub fn foreign_key(constraint: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(
            StorageErrorKind::ForeignKey {
                constraint: constraint.map(str::to_string),
            },
            message,
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Transient, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Other, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }
}

/// Remote source failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Transport failure or server-side error; retried after reconnecting
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with something we cannot use
    #[error("Source protocol error: {0}")]
    Protocol(String),
}

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Engine error: {0}")]
    Engine(#[from] feedsync_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Map this error onto the failure taxonomy the runner acts on.
    ///
    /// Transient storage errors only get here once the persister has used up
    /// its attempts, so they count as unclassified.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Storage(e) => match &e.kind {
                StorageErrorKind::Connectivity => FailureKind::Connectivity {
                    reason: WaitReason::DatabaseUnavailable,
                },
                StorageErrorKind::ForeignKey { constraint } => FailureKind::ForeignKey {
                    constraint: constraint.clone(),
                },
                StorageErrorKind::Transient | StorageErrorKind::Other => FailureKind::Fatal,
            },
            SyncError::Source(SourceError::Unavailable(_)) => FailureKind::Connectivity {
                reason: WaitReason::SourceUnavailable,
            },
            SyncError::Source(SourceError::Protocol(_)) => FailureKind::Fatal,
            SyncError::Cancelled => FailureKind::Cancelled,
            SyncError::Engine(_) | SyncError::Config(_) | SyncError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Result type alias for the sync service.
pub type Result<T> = std::result::Result<T, SyncError>;
