//! The locked graph
//!
//! Everything a network knows about its nodes, scopes and observers lives
//! in one [`Graph`] behind the network's mutex. Methods here are purely
//! structural: they never call user code. Work that needs user code
//! (subscription teardowns, `on_close` hooks) is collected into lists that
//! the transaction engine drains after releasing the lock.
//!
//! # Reference counting
//!
//! A node's `refs` is the number of observers attached to it plus, for each
//! active dependent, one per read of this node. Retaining a node from zero
//! activates it and retains its upstreams; releasing it to zero deactivates
//! it first and then releases its upstreams, so a chain `A -> B -> C`
//! deactivates `C, B, A`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::graph::{ActivationState, Behavior, Node, NodeId, UpdateScheduler};
use crate::reactive::input::Subscription;
use crate::reactive::observer::{Callback, ObserverEntry, ObserverStatus};
use crate::reactive::scope::{CloseHook, ScopeEntry, ScopeStatus};
use crate::reactive::spec::BranchSlot;
use crate::reactive::{ObserverId, ScopeId};

/// A lifecycle transition of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activating,
    Activated,
    Deactivating,
    Deactivated,
}

/// Delivered to the lifecycle listener after each transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub node: NodeId,
    pub transition: Transition,
}

/// A structural change applied only at a transaction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Boundary {
    Attach(ObserverId),
    Detach(ObserverId),
    Close(ScopeId),
}

/// A node whose last reference was just dropped.
struct Released {
    upstream: SmallVec<[NodeId; 4]>,
    branches: Vec<BranchSlot>,
    disposed: bool,
}

pub(crate) struct Graph {
    pub(crate) nodes: UpdateScheduler,
    scopes: HashMap<ScopeId, ScopeEntry>,
    pub(crate) observers: IndexMap<ObserverId, ObserverEntry>,
    root: ScopeId,

    /// Nodes retained from zero that have not been materialized yet.
    pub(crate) activating: IndexSet<NodeId>,

    /// Switches holding a pending branch in the running transaction.
    pub(crate) pending_switches: IndexSet<NodeId>,

    /// Branches to unwire at the next boundary.
    retired: Vec<(NodeId, BranchSlot)>,

    /// Scopes whose last holder is gone, waiting to be torn down.
    closing: Vec<ScopeId>,

    /// Nodes released to zero, waiting for their teardown to finish.
    deactivating: Vec<NodeId>,

    teardowns: Vec<Subscription>,
    close_hooks: Vec<CloseHook>,
    transitions: Vec<LifecycleEvent>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        let root = ScopeId::new();
        let mut scopes = HashMap::new();
        scopes.insert(root, ScopeEntry::new(None));
        Self {
            nodes: UpdateScheduler::new(),
            scopes,
            observers: IndexMap::new(),
            root,
            activating: IndexSet::new(),
            pending_switches: IndexSet::new(),
            retired: Vec::new(),
            closing: Vec::new(),
            deactivating: Vec::new(),
            teardowns: Vec::new(),
            close_hooks: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub(crate) fn root(&self) -> ScopeId {
        self.root
    }

    pub(crate) fn record(&mut self, node: NodeId, transition: Transition) {
        tracing::trace!(node = %node, ?transition, "lifecycle");
        self.transitions.push(LifecycleEvent { node, transition });
    }

    pub(crate) fn take_transitions(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.transitions)
    }

    // Nodes

    /// Insert a node owned by `owner`. Nodes created in a scope that is no
    /// longer open are never inserted: activating them reports
    /// [`Error::Disposed`].
    pub(crate) fn insert(&mut self, node: Node, upstream: &[NodeId]) -> NodeId {
        let id = node.id();
        let owner = node.owner();
        let Some(scope) = self.scopes.get_mut(&owner).filter(|scope| scope.is_open()) else {
            tracing::debug!(node = %id, scope = %owner, "node created in a closed scope");
            return id;
        };
        scope.nodes.push(id);
        self.nodes.add_node(node);
        for dependency in upstream {
            self.nodes.add_edge(*dependency, id);
        }
        id
    }

    /// Fail with [`Error::Disposed`] unless every node that retaining `id`
    /// would activate is present.
    fn check_retainable(&self, id: NodeId) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !visited.insert(next) {
                continue;
            }
            let node = self
                .nodes
                .get_node(next)
                .filter(|node| !node.is_disposed())
                .ok_or(Error::Disposed(next))?;
            if node.refs() == 0 {
                stack.extend(node.dependencies().iter().copied());
            }
        }
        Ok(())
    }

    /// Take a reference on `id`, activating it and its upstreams if this is
    /// the first one. Nothing changes on error.
    pub(crate) fn retain(&mut self, id: NodeId) -> Result<()> {
        self.check_retainable(id)?;
        self.retain_checked(id);
        Ok(())
    }

    fn retain_checked(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_node_mut(id) else {
                continue;
            };
            if node.increment_refs() > 1 {
                continue;
            }
            node.set_state(ActivationState::Activating);
            let upstream: SmallVec<[NodeId; 4]> = node.dependencies().into();
            self.activating.insert(id);
            self.record(id, Transition::Activating);
            stack.extend(upstream.into_iter().rev());
        }
    }

    /// Give back a reference on `id`, deactivating it and cascading to its
    /// upstreams if this was the last one. The first error is returned
    /// after the cascade has run to the end.
    pub(crate) fn release(&mut self, id: NodeId) -> Result<()> {
        enum Step {
            Release(NodeId),
            Finish(NodeId, Vec<BranchSlot>, bool),
        }

        let mut result = Ok(());
        let mut stack = vec![Step::Release(id)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Release(id) => match self.release_one(id) {
                    Ok(Some(released)) => {
                        stack.push(Step::Finish(id, released.branches, released.disposed));
                        stack.extend(released.upstream.into_iter().rev().map(Step::Release));
                    }
                    Ok(None) => {}
                    Err(err) => result = result.and(Err(err)),
                },
                Step::Finish(id, branches, disposed) => {
                    self.retired
                        .extend(branches.into_iter().map(|slot| (id, slot)));
                    if disposed {
                        self.nodes.remove_node(id);
                    }
                }
            }
        }
        result
    }

    /// Drop one reference. When it was the last, deactivate the node and
    /// hand back what the cascade still has to visit.
    fn release_one(&mut self, id: NodeId) -> Result<Option<Released>> {
        let node = self
            .nodes
            .get_node_mut(id)
            .ok_or(Error::RefUnderflow(id))?;
        let remaining = node.decrement_refs().ok_or(Error::RefUnderflow(id))?;
        if remaining > 0 {
            return Ok(None);
        }

        node.set_state(ActivationState::Deactivating);
        if !node.retains_value() {
            node.clear_value();
        }
        let upstream: SmallVec<[NodeId; 4]> = node.dependencies().into();
        let disposed = node.is_disposed();
        let mut branches = Vec::new();
        match &mut node.behavior {
            Behavior::External { running, .. } => {
                if let Some(subscription) = running.take() {
                    self.teardowns.push(subscription);
                }
            }
            Behavior::Switch(state) => {
                branches.extend(state.current.take());
                branches.extend(state.pending.take());
            }
            _ => {}
        }
        self.activating.shift_remove(&id);
        self.pending_switches.shift_remove(&id);
        self.deactivating.push(id);
        self.record(id, Transition::Deactivating);
        Ok(Some(Released {
            upstream,
            branches,
            disposed,
        }))
    }

    /// Undo the attaches that reached `failed` while it was activating.
    ///
    /// Observers on `failed` or on any activating node downstream of it are
    /// cancelled and detached, which releases everything they retained.
    /// Returns whether `failed` is no longer waiting to activate.
    pub(crate) fn abort_activation(&mut self, failed: NodeId) -> Result<bool> {
        let mut reached = HashSet::new();
        let mut stack = vec![failed];
        while let Some(id) = stack.pop() {
            if !self.activating.contains(&id) || !reached.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get_node(id) {
                stack.extend(node.dependents().iter().copied());
            }
        }

        let doomed: Vec<ObserverId> = self
            .observers
            .iter()
            .filter(|(_, entry)| {
                reached.contains(&entry.node) && matches!(entry.status, ObserverStatus::Attached { .. })
            })
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(entry) = self.observers.get(&id) {
                entry.cancel();
            }
            self.detach(id)?;
        }
        tracing::debug!(node = %failed, "activation rolled back");
        Ok(!self.activating.contains(&failed))
    }

    /// Mark nodes whose teardown has run as inactive.
    pub(crate) fn finish_deactivation(&mut self) {
        for id in std::mem::take(&mut self.deactivating) {
            match self.nodes.get_node_mut(id) {
                Some(node) if node.state() == ActivationState::Deactivating => {
                    node.set_state(ActivationState::Inactive);
                }
                Some(_) => continue,
                None => {}
            }
            self.record(id, Transition::Deactivated);
        }
    }

    pub(crate) fn activation_state(&self, id: NodeId) -> Option<ActivationState> {
        self.nodes.get_node(id).map(Node::state)
    }

    // Switch branches

    /// Wire `slot` into `switch`. As the current branch it replaces any
    /// previous one; otherwise it becomes the pending branch until commit.
    pub(crate) fn install_branch(&mut self, switch: NodeId, slot: BranchSlot, current: bool) -> Result<()> {
        let refs = self
            .nodes
            .get_node(switch)
            .map(Node::refs)
            .ok_or(Error::Disposed(switch))?;
        if refs > 0 {
            if let Err(err) = self.check_retainable(slot.output) {
                self.retire(switch, slot);
                return Err(err);
            }
        }
        self.nodes.add_edge(slot.output, switch);
        if refs > 0 {
            self.retain_checked(slot.output);
        }

        let Some(Behavior::Switch(state)) = self
            .nodes
            .get_node_mut(switch)
            .map(|node| &mut node.behavior)
        else {
            return Err(Error::Disposed(switch));
        };
        let replaced = if current {
            state.current.replace(slot)
        } else {
            self.pending_switches.insert(switch);
            state.pending.replace(slot)
        };
        if let Some(old) = replaced {
            self.retired.push((switch, old));
        }
        Ok(())
    }

    /// Promote pending branches whose key the selector settled on; retire
    /// the rest.
    pub(crate) fn promote_pending(&mut self) {
        for switch in std::mem::take(&mut self.pending_switches) {
            let Some(node) = self.nodes.get_node(switch) else {
                continue;
            };
            let Behavior::Switch(state) = &node.behavior else {
                continue;
            };
            let key = self
                .nodes
                .get_node(state.selector)
                .and_then(Node::value)
                .cloned();
            let key_eq = state.key_eq;

            let Some(Behavior::Switch(state)) = self
                .nodes
                .get_node_mut(switch)
                .map(|node| &mut node.behavior)
            else {
                continue;
            };
            let Some(pending) = state.pending.take() else {
                continue;
            };
            let settled = key.map(|key| key_eq(&pending.key, &key)).unwrap_or(false);
            let retired = if settled {
                state.current.replace(pending)
            } else {
                Some(pending)
            };
            if let Some(old) = retired {
                self.retired.push((switch, old));
            }
        }
    }

    /// Retire every pending branch of a transaction that did not commit.
    pub(crate) fn abandon_pending(&mut self) {
        for switch in std::mem::take(&mut self.pending_switches) {
            let pending = match self.nodes.get_node_mut(switch).map(|node| &mut node.behavior) {
                Some(Behavior::Switch(state)) => state.pending.take(),
                _ => None,
            };
            if let Some(slot) = pending {
                self.retired.push((switch, slot));
            }
        }
    }

    pub(crate) fn retire(&mut self, switch: NodeId, slot: BranchSlot) {
        self.retired.push((switch, slot));
    }

    fn unwire(&mut self, switch: NodeId, slot: BranchSlot) -> Result<()> {
        let wired = self
            .nodes
            .get_node(switch)
            .map(|node| (node.depends_on(slot.output), node.refs()));
        let mut result = Ok(());
        if let Some((true, refs)) = wired {
            self.nodes.remove_edge(slot.output, switch);
            if refs > 0 {
                result = self.release(slot.output);
            }
        }
        if let Some(scope) = slot.scope {
            self.begin_close(scope);
        }
        result
    }

    // Observers

    pub(crate) fn register_observer(
        &mut self,
        node: NodeId,
        scope: ScopeId,
        callback: Callback,
    ) -> (ObserverId, Arc<AtomicBool>, bool) {
        let id = ObserverId::new();
        let entry = ObserverEntry::new(node, scope, callback);
        let cancelled = Arc::clone(&entry.cancelled);
        match self.scopes.get_mut(&scope).filter(|scope| scope.is_open()) {
            Some(owner) => {
                owner.observers.insert(id);
                self.observers.insert(id, entry);
                (id, cancelled, true)
            }
            None => {
                entry.cancel();
                (id, cancelled, false)
            }
        }
    }

    /// Apply an attach: retain the observed node. Cancelled observers are
    /// dropped without touching the node.
    pub(crate) fn attach(&mut self, id: ObserverId) -> Result<()> {
        let Some(entry) = self.observers.get(&id) else {
            return Ok(());
        };
        if entry.is_cancelled() {
            self.forget_observer(id);
            return Ok(());
        }
        let node = entry.node;
        if let Err(err) = self.retain(node) {
            if let Some(entry) = self.observers.get(&id) {
                entry.cancel();
            }
            self.forget_observer(id);
            return Err(err);
        }
        if let Some(entry) = self.observers.get_mut(&id) {
            entry.status = ObserverStatus::Attached { primed: false };
        }
        if let Some(target) = self.nodes.get_node_mut(node) {
            target.add_observer(id);
        }
        Ok(())
    }

    /// Apply a detach: release the observed node if the attach had been
    /// applied.
    pub(crate) fn detach(&mut self, id: ObserverId) -> Result<()> {
        let Some(entry) = self.forget_observer(id) else {
            return Ok(());
        };
        if matches!(entry.status, ObserverStatus::Pending) {
            return Ok(());
        }
        if let Some(target) = self.nodes.get_node_mut(entry.node) {
            target.remove_observer(id);
        }
        self.release(entry.node)
    }

    fn forget_observer(&mut self, id: ObserverId) -> Option<ObserverEntry> {
        let entry = self.observers.shift_remove(&id)?;
        if let Some(scope) = self.scopes.get_mut(&entry.scope) {
            scope.observers.shift_remove(&id);
        }
        Some(entry)
    }

    // Scopes

    pub(crate) fn scope_is_open(&self, id: ScopeId) -> bool {
        self.scopes.get(&id).map(ScopeEntry::is_open).unwrap_or(false)
    }

    pub(crate) fn open_scope(&mut self, parent: Option<ScopeId>) -> Result<ScopeId> {
        let parent = parent.unwrap_or(self.root);
        let entry = self
            .scopes
            .get_mut(&parent)
            .filter(|entry| entry.is_open())
            .ok_or(Error::ScopeClosed(parent))?;
        let id = ScopeId::new();
        entry.children.insert(id);
        self.scopes.insert(id, ScopeEntry::new(Some(parent)));
        Ok(id)
    }

    pub(crate) fn retain_scope(&mut self, id: ScopeId) -> Result<()> {
        let entry = self
            .scopes
            .get_mut(&id)
            .filter(|entry| entry.is_open())
            .ok_or(Error::ScopeClosed(id))?;
        entry.holders += 1;
        Ok(())
    }

    /// Give back one hold. Returns whether that was the last one, in which
    /// case the scope's observers are already silenced and the teardown
    /// needs a [`Boundary::Close`].
    pub(crate) fn release_scope(&mut self, id: ScopeId) -> Result<bool> {
        let entry = self.scopes.get_mut(&id).ok_or(Error::ScopeClosed(id))?;
        if entry.holders == 0 {
            return Err(Error::ScopeOverReleased(id));
        }
        entry.holders -= 1;
        if entry.holders > 0 {
            return Ok(false);
        }
        self.begin_close(id);
        Ok(true)
    }

    pub(crate) fn add_close_hook(&mut self, id: ScopeId, hook: CloseHook) -> Result<()> {
        let entry = self
            .scopes
            .get_mut(&id)
            .filter(|entry| entry.is_open())
            .ok_or(Error::ScopeClosed(id))?;
        entry.on_close.push(hook);
        Ok(())
    }

    /// Mark `id` and its descendants closing and silence their observers.
    /// The structural teardown happens in [`Graph::settle_boundary`].
    pub(crate) fn begin_close(&mut self, id: ScopeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(entry) = self.scopes.get_mut(&next) else {
                continue;
            };
            entry.holders = 0;
            entry.status = ScopeStatus::Closing;
            stack.extend(entry.children.iter().copied());
            for observer in &entry.observers {
                if let Some(observer) = self.observers.get(observer) {
                    observer.cancel();
                }
            }
        }
        self.closing.push(id);
    }

    /// Tear down a closing scope: children first, then its observers, then
    /// its nodes.
    fn finish_close(&mut self, id: ScopeId, errors: &mut Vec<Error>) {
        let mut stack = vec![(id, false)];
        while let Some((scope, children_done)) = stack.pop() {
            if children_done {
                self.dispose_scope(scope, errors);
                continue;
            }
            let Some(entry) = self.scopes.get(&scope) else {
                continue;
            };
            let children: Vec<ScopeId> = entry.children.iter().copied().collect();
            stack.push((scope, true));
            stack.extend(children.into_iter().rev().map(|child| (child, false)));
        }
    }

    fn dispose_scope(&mut self, id: ScopeId, errors: &mut Vec<Error>) {
        let Some(entry) = self.scopes.remove(&id) else {
            return;
        };
        if let Some(parent) = entry.parent.and_then(|parent| self.scopes.get_mut(&parent)) {
            parent.children.shift_remove(&id);
        }
        for observer in entry.observers {
            if let Err(err) = self.detach(observer) {
                errors.push(err);
            }
        }
        for node in entry.nodes {
            let Some(target) = self.nodes.get_node_mut(node) else {
                continue;
            };
            target.mark_disposed();
            if target.refs() == 0 {
                self.activating.shift_remove(&node);
                self.nodes.remove_node(node);
            }
        }
        self.close_hooks.extend(entry.on_close);
        tracing::debug!(scope = %id, "scope closed");
    }

    /// Apply boundary messages: attaches first, then detaches, then scope
    /// closes, then whatever those cascade into. Returns whether any attach
    /// was applied.
    pub(crate) fn settle_boundary(&mut self, messages: Vec<Boundary>, errors: &mut Vec<Error>) -> bool {
        let mut attached = false;
        let mut detaches = Vec::new();
        for message in messages {
            match message {
                Boundary::Attach(id) => {
                    attached = true;
                    if let Err(err) = self.attach(id) {
                        errors.push(err);
                    }
                }
                Boundary::Detach(id) => detaches.push(id),
                Boundary::Close(scope) => self.closing.push(scope),
            }
        }
        for id in detaches {
            if let Err(err) = self.detach(id) {
                errors.push(err);
            }
        }
        loop {
            if let Some(scope) = self.closing.pop() {
                self.finish_close(scope, errors);
            } else if let Some((switch, slot)) = self.retired.pop() {
                if let Err(err) = self.unwire(switch, slot) {
                    errors.push(err);
                }
            } else {
                break;
            }
        }
        attached
    }

    /// Tear `subscription` down at the next cleanup.
    pub(crate) fn defer_teardown(&mut self, subscription: Subscription) {
        self.teardowns.push(subscription);
    }

    /// Subscriptions and hooks collected since the last call.
    pub(crate) fn take_cleanup(&mut self) -> (Vec<Subscription>, Vec<CloseHook>) {
        (
            std::mem::take(&mut self.teardowns),
            std::mem::take(&mut self.close_hooks),
        )
    }

    /// Drop everything. Returns the subscriptions still running so they can
    /// be torn down outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<Subscription> {
        let mut running = std::mem::take(&mut self.teardowns);
        for node in self.nodes.clear() {
            if let Behavior::External {
                running: Some(subscription),
                ..
            } = node.behavior
            {
                running.push(subscription);
            }
        }
        self.scopes.clear();
        self.observers.clear();
        self.activating.clear();
        self.pending_switches.clear();
        self.retired.clear();
        self.closing.clear();
        self.deactivating.clear();
        self.close_hooks.clear();
        running
    }
}
