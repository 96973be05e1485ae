//! Error types for the feedsync engine.

use crate::{FeedVersion, ServiceId};
use thiserror::Error;

/// All possible errors from the feedsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Cursor errors
    #[error("feed cursor for {service} cannot move back from {current} to {attempted}")]
    CursorRegression {
        service: ServiceId,
        current: FeedVersion,
        attempted: FeedVersion,
    },

    #[error("cannot commit version {attempted} for {service}: last fetched version is {fetched:?}")]
    CommitBeyondFetched {
        service: ServiceId,
        attempted: FeedVersion,
        fetched: Option<FeedVersion>,
    },

    // Configuration errors
    #[error("page limit must be at least 1, got {0}")]
    InvalidPageLimit(usize),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("service {0} cannot depend on itself")]
    SelfDependency(ServiceId),

    // Mapping errors
    #[error("record {key} could not be mapped to a staging row: {reason}")]
    InvalidPayload { key: String, reason: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
