//! Snapshot types for serializing counter state.
//!
//! # Feature Flag
//!
//! This module requires the `serde` feature:
//!
//! ```toml
//! [dependencies]
//! egg-counters = { version = "0.1", features = ["serde"] }
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use egg_counters::Arena;
//! use egg_counters::snapshot::MetricsSnapshot;
//!
//! let arena = Arena::attach(pid)?;
//! let counters = arena.counters();
//! let snapshot = MetricsSnapshot::collect(counters.iter().map(|c| c as _)).with_pid(pid);
//! let json = serde_json::to_string(&snapshot)?;
//! ```

use crate::counter::Observable;
use serde::{Deserialize, Serialize};

/// A snapshot of a single counter's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub category: String,
    pub name: String,
    pub value: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl CounterSnapshot {
    /// Creates a new counter snapshot.
    pub fn new(category: impl Into<String>, name: impl Into<String>, value: i64) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            value,
            description: String::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Creates a snapshot from an observable counter.
    pub fn from_observable(counter: &dyn Observable) -> Self {
        Self::new(counter.category(), counter.name(), counter.value())
            .with_description(counter.description())
    }
}

/// A point-in-time capture of a set of counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Process the counters were read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Optional timestamp in milliseconds since Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    /// The counter snapshots.
    pub counters: Vec<CounterSnapshot>,
}

impl MetricsSnapshot {
    /// Creates a new metrics snapshot with the given counters.
    pub fn new(counters: Vec<CounterSnapshot>) -> Self {
        Self {
            pid: None,
            timestamp_ms: None,
            counters,
        }
    }

    /// Collects snapshots from an iterator of observable counters.
    pub fn collect<'a>(counters: impl Iterator<Item = &'a dyn Observable>) -> Self {
        Self::new(counters.map(CounterSnapshot::from_observable).collect())
    }

    /// Records the process the counters belong to.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Records when the snapshot was taken.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Finds a counter by category and name.
    pub fn get(&self, category: &str, name: &str) -> Option<&CounterSnapshot> {
        self.counters
            .iter()
            .find(|c| c.category == category && c.name == name)
    }
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
