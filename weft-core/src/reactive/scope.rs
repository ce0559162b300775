//! Activation Scopes
//!
//! A scope is a reference-counted lifetime. Nodes and observers created
//! while a scope is ambient belong to it; closing the last holder of a
//! scope cancels its observers, closes its child scopes and disposes its
//! nodes. Work that touches the live graph (releasing references, tearing
//! down external subscriptions, running `on_close` hooks) is applied at the
//! next transaction boundary, never in the middle of a propagation pass.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use crate::error::Result;
use crate::graph::NodeId;
use crate::network::Network;

use super::context::ReactiveContext;
use super::observer::ObserverId;

/// Unique identifier for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeStatus {
    Open,

    /// The last holder closed it; teardown is queued for the next
    /// boundary.
    Closing,
}

pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

/// A scope as recorded in the graph.
pub(crate) struct ScopeEntry {
    pub(crate) parent: Option<ScopeId>,
    pub(crate) holders: usize,
    pub(crate) status: ScopeStatus,
    pub(crate) children: IndexSet<ScopeId>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) observers: IndexSet<ObserverId>,
    pub(crate) on_close: Vec<CloseHook>,
}

impl ScopeEntry {
    pub(crate) fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            holders: 1,
            status: ScopeStatus::Open,
            children: IndexSet::new(),
            nodes: Vec::new(),
            observers: IndexSet::new(),
            on_close: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.status == ScopeStatus::Open
    }
}

/// A holder of an activation scope.
///
/// Each handle accounts for one hold on the scope. [`retain`](Self::retain)
/// takes another hold; [`close`](Self::close) gives one back. The scope
/// closes when the last hold is given back.
pub struct ScopeHandle {
    network: Network,
    id: ScopeId,
}

impl ScopeHandle {
    pub(crate) fn new(network: Network, id: ScopeId) -> Self {
        Self { network, id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The network this scope belongs to.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Whether the scope is still open.
    pub fn is_open(&self) -> bool {
        self.network.scope_is_open(self.id)
    }

    /// Open a scope nested in this one. It closes no later than this scope.
    pub fn open_child(&self) -> Result<ScopeHandle> {
        self.network.open_scope_in(Some(self.id))
    }

    /// Take another hold on this scope.
    pub fn retain(&self) -> Result<ScopeHandle> {
        self.network.retain_scope(self.id)?;
        Ok(ScopeHandle::new(self.network.clone(), self.id))
    }

    /// Give back one hold on this scope.
    ///
    /// Closing more often than the scope was opened or retained is an
    /// error.
    pub fn close(&self) -> Result<()> {
        self.network.close_scope(self.id)
    }

    /// Run `hook` in the epilogue that tears this scope down.
    pub fn on_close<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.network.add_close_hook(self.id, Box::new(hook))
    }

    /// Run `f` with this scope as the ambient scope, so that nodes and
    /// observers created inside it belong to this scope.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _ctx = ReactiveContext::enter_scope(self.network.id(), self.id);
        f()
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Closes its scope when dropped, so every exit path releases it.
pub(crate) struct ScopeGuard {
    handle: ScopeHandle,
    armed: bool,
}

impl ScopeGuard {
    pub(crate) fn new(handle: ScopeHandle) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    pub(crate) fn handle(&self) -> &ScopeHandle {
        &self.handle
    }

    /// Close the scope now and report the outcome.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.handle.close()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.handle.close() {
                tracing::warn!(scope = %self.handle.id(), error = %err, "failed to close scope on unwind");
            }
        }
    }
}
