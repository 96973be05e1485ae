//! Foreign-key dependencies between services.
//!
//! A consumer declares which violated constraint means "the producing service
//! has not committed the parent row yet". Constraint names are compared
//! case-insensitively since most backends fold unquoted identifiers.

use crate::{error::Result, Error, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static map of violated constraint name → producing service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, ServiceId>", into = "BTreeMap<String, ServiceId>")]
pub struct ServiceDependency {
    constraints: BTreeMap<String, ServiceId>,
}

/// What to do about a foreign-key violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyResolution {
    /// Wait for `producer` to make progress, then retry the batch.
    WaitFor {
        constraint: String,
        producer: ServiceId,
    },
    /// No mapping exists; the failure cannot heal itself.
    Unmapped { constraint: Option<String> },
}

impl ServiceDependency {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping (builder style).
    pub fn with(mut self, constraint: impl AsRef<str>, producer: impl Into<ServiceId>) -> Self {
        self.insert(constraint, producer);
        self
    }

    /// Add a mapping.
    pub fn insert(&mut self, constraint: impl AsRef<str>, producer: impl Into<ServiceId>) {
        self.constraints
            .insert(normalize(constraint.as_ref()), producer.into());
    }

    /// Producing service for a violated constraint.
    pub fn producer_for(&self, constraint: &str) -> Option<&ServiceId> {
        self.constraints.get(&normalize(constraint))
    }

    /// All producing services, deduplicated.
    pub fn producers(&self) -> Vec<&ServiceId> {
        let mut producers: Vec<_> = self.constraints.values().collect();
        producers.sort();
        producers.dedup();
        producers
    }

    /// Number of mapped constraints.
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Check if no constraints are mapped.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Reject maps in which `consumer` waits on itself.
    pub fn validate(&self, consumer: &str) -> Result<()> {
        if self.constraints.values().any(|p| p == consumer) {
            return Err(Error::SelfDependency(consumer.to_string()));
        }
        Ok(())
    }

    /// Decide how to handle a violation of `constraint`.
    pub fn resolve(&self, constraint: Option<&str>) -> DependencyResolution {
        match constraint {
            Some(name) => match self.producer_for(name) {
                Some(producer) => DependencyResolution::WaitFor {
                    constraint: name.to_string(),
                    producer: producer.clone(),
                },
                None => DependencyResolution::Unmapped {
                    constraint: Some(name.to_string()),
                },
            },
            None => DependencyResolution::Unmapped { constraint: None },
        }
    }
}

impl From<BTreeMap<String, ServiceId>> for ServiceDependency {
    fn from(map: BTreeMap<String, ServiceId>) -> Self {
        let mut dependency = Self::new();
        for (constraint, producer) in map {
            dependency.insert(constraint, producer);
        }
        dependency
    }
}

impl From<ServiceDependency> for BTreeMap<String, ServiceId> {
    fn from(dependency: ServiceDependency) -> Self {
        dependency.constraints
    }
}

fn normalize(constraint: &str) -> String {
    constraint.trim().trim_matches('"').to_ascii_lowercase()
}
