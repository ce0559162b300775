//! Observer types for the reactive system.
//!
//! An observer is an epilogue-phase callback attached to a cell or stream.
//! Attaching an observer is what makes a subgraph hot: the observed node
//! and everything upstream of it are retained at the next transaction
//! boundary and released again once the observer is cancelled.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{NodeId, Value};
use crate::network::Network;

use super::scope::ScopeId;

/// Unique identifier for an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Generate a new unique observer ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Type-erased observer callback.
pub(crate) type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Erase a typed callback. Values of any other type are skipped.
pub(crate) fn erase<T, F>(f: F) -> Callback
where
    T: 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(move |value: &Value| {
        if let Some(value) = value.downcast_ref::<T>() {
            f(value);
        }
    })
}

/// Where an observer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverStatus {
    /// Registered; its attach has not been applied yet.
    Pending,

    /// Holding a reference on its node. `primed` is false until the first
    /// delivery (a cell's initial value, or nothing for a stream).
    Attached { primed: bool },
}

/// An observer as recorded in the graph.
pub(crate) struct ObserverEntry {
    pub(crate) node: NodeId,
    pub(crate) scope: ScopeId,
    pub(crate) callback: Callback,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) status: ObserverStatus,
}

impl ObserverEntry {
    pub(crate) fn new(node: NodeId, scope: ScopeId, callback: Callback) -> Self {
        Self {
            node,
            scope,
            callback,
            cancelled: Arc::new(AtomicBool::new(false)),
            status: ObserverStatus::Pending,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Handle returned by `observe`.
///
/// Dropping the handle does not cancel the observer; its lifetime belongs
/// to the scope it was created in.
pub struct ObserverHandle {
    network: Network,
    id: ObserverId,
    cancelled: Arc<AtomicBool>,
}

impl ObserverHandle {
    pub(crate) fn new(network: Network, id: ObserverId, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            network,
            id,
            cancelled,
        }
    }

    /// Get the observer's unique ID.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the observer has been cancelled. Besides [`cancel`], closing
    /// its scope or a failure while activating its subgraph cancels it.
    ///
    /// [`cancel`]: ObserverHandle::cancel
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop the callback and release the observed subgraph.
    ///
    /// The callback stops immediately; the release is applied at the next
    /// transaction boundary.
    pub fn cancel(&self) -> Result<()> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Err(Error::ObserverCancelled(self.id));
        }
        self.network.request_detach(self.id)
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Network, NetworkConfig};

    #[test]
    fn observer_ids_are_unique() {
        let id1 = ObserverId::new();
        let id2 = ObserverId::new();
        let id3 = ObserverId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn entry_cancellation_is_shared() {
        let entry = ObserverEntry::new(NodeId::new(), ScopeId::new(), Arc::new(|_| {}));
        let flag = Arc::clone(&entry.cancelled);

        assert!(!entry.is_cancelled());
        entry.cancel();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(entry.status, ObserverStatus::Pending);
    }

    #[test]
    fn cancelling_twice_is_an_error() {
        let network = Network::new(NetworkConfig::manual());
        let input = network.state_input(1);
        let handle = input.state().observe(|_| {});

        assert!(handle.cancel().is_ok());
        assert!(handle.is_cancelled());
        assert!(matches!(handle.cancel(), Err(Error::ObserverCancelled(id)) if id == handle.id()));
    }
}
