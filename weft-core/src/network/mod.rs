//! Network Runtime
//!
//! A [`Network`] owns one dependency graph and serializes every transaction
//! that runs on it. Handles of every kind share the network through an
//! `Arc`, so any thread may write; whichever thread drains the queue runs
//! the transactions, one at a time.
//!
//! # Transaction phases
//!
//! 1. Attaches queued before the transaction retain their nodes
//! 2. External sources that just activated run their start hooks
//! 3. Newly active nodes compute their initial values
//! 4. The batch's writes are applied and the affected nodes re-derived
//! 5. The staging area is committed
//! 6. Observers are notified, with the graph lock released
//! 7. Detaches, scope closes and retired branches are applied, and the
//!    teardowns they produce run with the lock released
//!
//! A node that fails in phase 2 or 3 cancels the observers whose attach
//! reached it, and the transaction continues without them. Other failures
//! in phases 2 to 4 discard the staging area and skip notifications;
//! phase 7 always runs.

mod graph;
mod runtime;
mod transaction;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use graph::{LifecycleEvent, Transition};
pub use runtime::{Batch, Network};

pub(crate) use runtime::WeakNetwork;

/// Unique identifier for a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(u64);

impl NetworkId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network-{}", self.0)
    }
}
