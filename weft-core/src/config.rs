//! Network Configuration
//!
//! Every network is created from a [`NetworkConfig`]. The defaults suit
//! interactive use: writes drain on the calling thread as soon as they are
//! enqueued. Tests usually switch to [`DrainMode::Manual`] so they can
//! decide when transactions run.
//!
//! Configurations deserialize from JSON with missing fields falling back to
//! their defaults:
//!
//! ```rust
//! use weft_core::{DrainMode, NetworkConfig};
//!
//! let config = NetworkConfig::from_json(r#"{ "name": "connectivity", "drain_mode": "manual" }"#).unwrap();
//! assert_eq!(config.name, "connectivity");
//! assert_eq!(config.drain_mode, DrainMode::Manual);
//! assert_eq!(config.max_splice_rounds, 64);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// When queued transactions are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// The call that enqueues work drains the queue before returning,
    /// unless another drain is already in progress.
    #[default]
    Immediate,

    /// Work stays queued until `Network::run_until_quiescent` is called.
    Manual,

    /// The driver task spawned by `Network::launch` drains the queue.
    Background,
}

/// Configuration for a [`Network`](crate::Network).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Label attached to the network's tracing spans.
    pub name: String,

    /// When queued transactions are run.
    pub drain_mode: DrainMode,

    /// Upper bound on transactions run by a single drain.
    pub max_transactions_per_drain: usize,

    /// Upper bound on branches spliced in by one transaction.
    pub max_splice_rounds: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "weft".to_string(),
            drain_mode: DrainMode::Immediate,
            max_transactions_per_drain: 100_000,
            max_splice_rounds: 64,
        }
    }
}

impl NetworkConfig {
    /// A configuration for deterministic tests: nothing runs until the
    /// queue is drained explicitly.
    pub fn manual() -> Self {
        Self::default().with_drain_mode(DrainMode::Manual)
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_drain_mode(mut self, mode: DrainMode) -> Self {
        self.drain_mode = mode;
        self
    }

    pub fn with_max_transactions_per_drain(mut self, limit: usize) -> Self {
        self.max_transactions_per_drain = limit;
        self
    }

    pub fn with_max_splice_rounds(mut self, rounds: usize) -> Self {
        self.max_splice_rounds = rounds;
        self
    }
}
