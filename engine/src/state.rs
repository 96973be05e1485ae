//! Process-wide connectivity state and the failure taxonomy.
//!
//! These are plain values. The server crate wraps [`ProcessStatus`] in a
//! watch channel so every loop can read and mutate it concurrently.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the process is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitReason {
    /// The relational store cannot be reached
    DatabaseUnavailable,
    /// The remote source system cannot be reached
    SourceUnavailable,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::DatabaseUnavailable => write!(f, "database unavailable"),
            WaitReason::SourceUnavailable => write!(f, "source unavailable"),
        }
    }
}

/// Global connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ProcessState {
    /// All loops may run
    #[default]
    Normal,
    /// Loops hold at the connectivity gate until a probe succeeds
    Waiting(WaitReason),
}

impl ProcessState {
    /// The wait reason, if waiting.
    pub fn wait_reason(&self) -> Option<WaitReason> {
        match self {
            ProcessState::Normal => None,
            ProcessState::Waiting(reason) => Some(*reason),
        }
    }
}

/// Connectivity state plus the counters loops use to observe transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    /// Current state
    pub state: ProcessState,
    /// Incremented on every Waiting → Normal transition
    pub recovery_epoch: u64,
    /// Set while a database maintenance window is in progress
    pub maintenance: bool,
}

impl ProcessStatus {
    /// Enter `Waiting(reason)`. The first reason wins until recovery.
    ///
    /// Returns true if the state changed.
    pub fn enter_waiting(&mut self, reason: WaitReason) -> bool {
        match self.state {
            ProcessState::Normal => {
                self.state = ProcessState::Waiting(reason);
                true
            }
            ProcessState::Waiting(_) => false,
        }
    }

    /// Return to `Normal`, bumping the recovery epoch.
    ///
    /// Returns true if the state changed.
    pub fn restore(&mut self) -> bool {
        match self.state {
            ProcessState::Normal => false,
            ProcessState::Waiting(_) => {
                self.state = ProcessState::Normal;
                self.recovery_epoch += 1;
                true
            }
        }
    }
}

/// Classification of an iteration failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureKind {
    /// Go to `Waiting(reason)` and retry after a short delay
    Connectivity { reason: WaitReason },
    /// Hand to the dependency coordinator
    ForeignKey { constraint: Option<String> },
    /// Shutdown in progress; not an error
    Cancelled,
    /// Log and terminate the process
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_wait_reason_wins() {
        let mut status = ProcessStatus::default();
        assert!(status.enter_waiting(WaitReason::DatabaseUnavailable));
        assert!(!status.enter_waiting(WaitReason::SourceUnavailable));
        assert_eq!(
            status.state,
            ProcessState::Waiting(WaitReason::DatabaseUnavailable)
        );
    }

    #[test]
    fn restore_bumps_epoch_once() {
        let mut status = ProcessStatus::default();
        assert!(!status.restore());
        assert_eq!(status.recovery_epoch, 0);

        status.enter_waiting(WaitReason::SourceUnavailable);
        assert!(status.restore());
        assert!(!status.restore());
        assert_eq!(status.recovery_epoch, 1);
        assert_eq!(status.state.wait_reason(), None);
    }

    #[test]
    fn serialization_format() {
        let state = ProcessState::Waiting(WaitReason::DatabaseUnavailable);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"waiting","reason":"databaseUnavailable"}"#);
    }
}
