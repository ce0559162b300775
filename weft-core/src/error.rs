//! Error types for the reactive network.

use thiserror::Error;

use crate::graph::{ActivationState, NodeId};
use crate::reactive::{ObserverId, ScopeId};

/// Errors surfaced by the network.
///
/// Usage errors are reported synchronously at the call that made them;
/// failures inside a transaction are reported by whichever call drained
/// that transaction.
#[derive(Debug, Error)]
pub enum Error {
    /// The node was torn down together with the scope that owned it.
    #[error("node {0} has been disposed")]
    Disposed(NodeId),

    /// The node holds no settled value because it is not active.
    #[error("node {node} is not active (state: {state:?})")]
    Inactive {
        node: NodeId,
        state: ActivationState,
    },

    /// A derivation tried to read a cell outside the propagation order.
    #[error("cannot sample node {0} while the network is propagating")]
    SampleDuringPropagation(NodeId),

    /// A derivation tried to attach an observer.
    #[error("cannot observe node {0} while the network is propagating")]
    ObserveDuringPropagation(NodeId),

    /// The scope has already been closed and removed.
    #[error("scope {0} is closed")]
    ScopeClosed(ScopeId),

    /// The scope was closed more times than it was opened.
    #[error("scope {0} released more times than it was opened")]
    ScopeOverReleased(ScopeId),

    /// A build specification ran without an ambient scope.
    #[error("no ambient scope to run the build specification in")]
    NoAmbientScope,

    /// The observer was already cancelled.
    #[error("observer {0} is already cancelled")]
    ObserverCancelled(ObserverId),

    /// A map/combine function failed during propagation.
    #[error("derivation of node {node} failed: {message}")]
    Derivation { node: NodeId, message: String },

    /// A build specification spliced in by a switch node failed.
    #[error("build specification for switch {node} failed: {message}")]
    Build { node: NodeId, message: String },

    /// An external source's start hook failed.
    #[error("external source {node} failed to start: {message}")]
    SourceFailed { node: NodeId, message: String },

    /// An observer callback panicked during the epilogue.
    #[error("observer callback panicked: {0}")]
    ObserverPanicked(String),

    /// The dependency graph contains a cycle through this node.
    #[error("dependency cycle through node {0}")]
    Cycle(NodeId),

    /// A switch node kept requesting new branches within one transaction.
    #[error("switch {node} did not settle after {rounds} splice rounds")]
    SpliceLimit { node: NodeId, rounds: usize },

    /// A single drain ran more transactions than the configured limit.
    #[error("drain exceeded {0} transactions; observers may be feeding back into their inputs")]
    DrainLimit(usize),

    /// A release was requested on a node that holds no references.
    #[error("reference count underflow on node {0}")]
    RefUnderflow(NodeId),

    /// A drain was requested from inside a running transaction.
    #[error("cannot drain the network from inside a transaction")]
    ReentrantDrain,

    /// The network has been shut down.
    #[error("network has shut down")]
    ShutDown,

    /// `launch` was called outside a Tokio runtime.
    #[error("launching a network requires a running Tokio runtime")]
    NoRuntime,

    /// The network configuration could not be parsed.
    #[error("invalid network configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
