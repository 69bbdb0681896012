//! JSON observer for serializing counters.
//!
//! This module provides [`JsonObserver`], which serializes a collection of
//! [`Observable`] counters to JSON using the types in
//! [`snapshot`](crate::snapshot).
//!
//! # Feature Flag
//!
//! This module requires the `json` feature:
//!
//! ```toml
//! [dependencies]
//! egg-counters = { version = "0.1", features = ["json"] }
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use egg_counters::{Arena, Observable};
//! use egg_counters::observers::json::JsonObserver;
//!
//! let arena = Arena::attach(pid)?;
//! let counters = arena.counters();
//!
//! let json = JsonObserver::new()
//!     .with_pid(pid)
//!     .to_json(counters.iter().map(|c| c as &dyn Observable))?;
//! // {"pid":1234,"counters":[{"category":"Cache","name":"Hits","value":1000}]}
//! ```

use crate::counter::Observable;
use crate::snapshot::{current_timestamp_ms, CounterSnapshot, MetricsSnapshot};

/// Configuration for the JSON observer.
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    /// Whether to pretty-print the JSON output.
    pub pretty: bool,
    /// Whether to include a timestamp in the output.
    pub include_timestamp: bool,
    /// Process id recorded in the output.
    pub pid: Option<u32>,
}

/// An observer that serializes counters to a [`MetricsSnapshot`] JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonObserver {
    config: JsonConfig,
}

impl JsonObserver {
    /// Creates a new JSON observer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new JSON observer with the specified configuration.
    pub fn with_config(config: JsonConfig) -> Self {
        Self { config }
    }

    /// Enables or disables pretty-printing.
    pub fn pretty(mut self, enabled: bool) -> Self {
        self.config.pretty = enabled;
        self
    }

    /// Enables or disables timestamp inclusion.
    pub fn include_timestamp(mut self, enabled: bool) -> Self {
        self.config.include_timestamp = enabled;
        self
    }

    /// Records the process the counters were read from.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.config.pid = Some(pid);
        self
    }

    /// Builds the snapshot that [`to_json`](Self::to_json) serializes.
    pub fn collect<'a>(&self, counters: impl Iterator<Item = &'a dyn Observable>) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new(counters.map(CounterSnapshot::from_observable).collect());
        snapshot.pid = self.config.pid;
        if self.config.include_timestamp {
            snapshot.timestamp_ms = Some(current_timestamp_ms());
        }
        snapshot
    }

    /// Serializes counters to a JSON string.
    pub fn to_json<'a>(
        &self,
        counters: impl Iterator<Item = &'a dyn Observable>,
    ) -> Result<String, serde_json::Error> {
        let snapshot = self.collect(counters);
        if self.config.pretty {
            serde_json::to_string_pretty(&snapshot)
        } else {
            serde_json::to_string(&snapshot)
        }
    }
}
