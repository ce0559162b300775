//! Graph Nodes
//!
//! The arena record for every cell and stream, plus the id and state types
//! exposed on the public surface.
//!
//! A node is either a value cell (it has a current value) or an event
//! stream (it only carries an occurrence during the transaction in which it
//! fires). Values are type erased so that one arena can hold nodes of every
//! type; the typed handles in [`crate::reactive`] downcast on the way out.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::reactive::input::{StartFn, Subscription};
use crate::reactive::spec::SwitchState;
use crate::reactive::{ObserverId, ScopeId};

/// Unique identifier for a node in the dependency graph.
///
/// Ids come from a process-wide counter, so a node id never collides with
/// one from another network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a node obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A value that never changes.
    Constant,

    /// A mutable root written through the pending-write queue.
    Input,

    /// A root fed by an external callback that subscribes on activation.
    External,

    /// A node derived from its upstream nodes.
    Derived,

    /// A cell that follows whichever branch its selector currently picks.
    Switch,
}

/// Whether a node is a value cell or an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Holds a current value.
    State,

    /// Carries occurrences only within the transaction in which it fires.
    Events,
}

/// Activation state of a node.
///
/// ```text
/// Inactive -> Activating -> Active -> Deactivating -> Inactive
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// Not referenced by any observer; holds no derived value.
    Inactive,

    /// Referenced, but its value has not been computed yet.
    Activating,

    /// Referenced and settled.
    Active,

    /// No longer referenced; waiting for its external subscription to be
    /// torn down.
    Deactivating,
}

/// A type-erased node value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Type-erased equality used to detect whether a cell actually changed.
pub(crate) type EqFn = fn(&Value, &Value) -> bool;

/// Equality for values of type `T`. Values of any other type never compare
/// equal.
pub(crate) fn value_eq<T: PartialEq + 'static>(a: &Value, b: &Value) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A derivation function.
///
/// Returns `Ok(None)` when the node does not change (cells) or does not
/// fire (streams) in this transaction.
pub(crate) type DeriveFn = dyn Fn(&Inputs<'_>) -> Result<Option<Value>, String> + Send + Sync;

/// One upstream input as seen by a derivation.
#[derive(Clone)]
pub(crate) struct Slot {
    /// The transaction view of a cell, or the occurrence of a stream.
    pub(crate) value: Option<Value>,

    /// Whether the upstream changed (cells) or fired (streams) in this
    /// transaction.
    pub(crate) changed: bool,
}

/// The inputs handed to a derivation function.
pub(crate) struct Inputs<'a> {
    slots: &'a [Slot],
    prev: Option<&'a Value>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(slots: &'a [Slot], prev: Option<&'a Value>) -> Self {
        Self { slots, prev }
    }

    /// The value of upstream `index`, which must be present.
    pub(crate) fn get<T: 'static>(&self, index: usize) -> Result<&T, String> {
        self.slots
            .get(index)
            .and_then(|slot| slot.value.as_ref())
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| format!("input {index} has no value"))
    }

    /// The occurrence of upstream `index`, if it fired in this transaction.
    pub(crate) fn fired<T: 'static>(&self, index: usize) -> Option<&T> {
        self.slots
            .get(index)
            .filter(|slot| slot.changed)
            .and_then(|slot| slot.value.as_ref())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Whether upstream `index` changed in this transaction.
    pub(crate) fn changed(&self, index: usize) -> bool {
        self.slots.get(index).map(|slot| slot.changed).unwrap_or(false)
    }

    /// Number of upstream inputs.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// This node's own committed value, if it has one.
    pub(crate) fn prev<T: 'static>(&self) -> Option<&T> {
        self.prev.and_then(|value| value.downcast_ref::<T>())
    }
}

/// Kind-specific node data.
pub(crate) enum Behavior {
    Constant,
    Input,
    External {
        /// Value a cell source starts from on every activation.
        initial: Option<Value>,
        start: Arc<StartFn>,
        running: Option<Subscription>,
    },
    Derived(Box<DeriveFn>),
    Switch(SwitchState),
}

impl Behavior {
    fn kind(&self) -> NodeKind {
        match self {
            Behavior::Constant => NodeKind::Constant,
            Behavior::Input => NodeKind::Input,
            Behavior::External { .. } => NodeKind::External,
            Behavior::Derived(_) => NodeKind::Derived,
            Behavior::Switch(_) => NodeKind::Switch,
        }
    }
}

/// A node in the dependency graph.
pub(crate) struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    flavor: Flavor,

    pub(crate) behavior: Behavior,

    state: ActivationState,

    /// Observer subscriptions plus active dependents holding this node.
    refs: usize,

    /// Nodes that this node depends on, in the order its derivation reads
    /// them. A switch keeps its selector first, followed by branch outputs.
    upstream: SmallVec<[NodeId; 4]>,

    /// Nodes that depend on this node.
    dependents: IndexSet<NodeId>,

    /// Scope whose closing disposes this node.
    owner: ScopeId,

    disposed: bool,

    /// Committed value. Always present for constants and inputs; present
    /// for other cells only while active.
    value: Option<Value>,

    /// Equality for cells.
    eq: Option<EqFn>,

    /// Observers attached directly to this node, in registration order.
    observers: SmallVec<[ObserverId; 2]>,
}

impl Node {
    /// Create a new inactive node.
    pub(crate) fn new(
        flavor: Flavor,
        behavior: Behavior,
        owner: ScopeId,
        eq: Option<EqFn>,
        value: Option<Value>,
    ) -> Self {
        Self {
            id: NodeId::new(),
            flavor,
            behavior,
            state: ActivationState::Inactive,
            refs: 0,
            upstream: SmallVec::new(),
            dependents: IndexSet::new(),
            owner,
            disposed: false,
            value,
            eq,
            observers: SmallVec::new(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.behavior.kind()
    }

    pub(crate) fn is_state(&self) -> bool {
        self.flavor == Flavor::State
    }

    pub(crate) fn state(&self) -> ActivationState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ActivationState) {
        self.state = state;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == ActivationState::Active
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs
    }

    pub(crate) fn increment_refs(&mut self) -> usize {
        self.refs += 1;
        self.refs
    }

    /// Returns the remaining count, or `None` if the count was already zero.
    pub(crate) fn decrement_refs(&mut self) -> Option<usize> {
        self.refs = self.refs.checked_sub(1)?;
        Some(self.refs)
    }

    /// Roots that keep their value while inactive.
    pub(crate) fn retains_value(&self) -> bool {
        matches!(self.kind(), NodeKind::Constant | NodeKind::Input)
    }

    pub(crate) fn owner(&self) -> ScopeId {
        self.owner
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn mark_disposed(&mut self) {
        self.disposed = true;
    }

    pub(crate) fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub(crate) fn clear_value(&mut self) {
        self.value = None;
    }

    /// Whether `candidate` differs from the committed value.
    pub(crate) fn differs(&self, candidate: &Value) -> bool {
        match (&self.value, self.eq) {
            (Some(current), Some(eq)) => !eq(current, candidate),
            _ => true,
        }
    }

    /// Add a dependency (a node that this node reads from).
    ///
    /// A node may read the same upstream more than once; every read is a
    /// separate input slot and holds its own reference while active.
    pub(crate) fn add_dependency(&mut self, node_id: NodeId) {
        self.upstream.push(node_id);
    }

    /// Remove one read of a dependency, the last one recorded.
    pub(crate) fn remove_dependency(&mut self, node_id: NodeId) {
        if let Some(pos) = self.upstream.iter().rposition(|id| *id == node_id) {
            self.upstream.remove(pos);
        }
    }

    pub(crate) fn depends_on(&self, node_id: NodeId) -> bool {
        self.upstream.contains(&node_id)
    }

    /// Get all dependencies, in read order.
    pub(crate) fn dependencies(&self) -> &[NodeId] {
        &self.upstream
    }

    /// Add a dependent (a node that reads from this node).
    pub(crate) fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    /// Get all dependents.
    pub(crate) fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    pub(crate) fn observers(&self) -> &[ObserverId] {
        &self.observers
    }

    pub(crate) fn add_observer(&mut self, observer: ObserverId) {
        self.observers.push(observer);
    }

    pub(crate) fn remove_observer(&mut self, observer: ObserverId) {
        self.observers.retain(|id| *id != observer);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn derived(owner: ScopeId) -> Node {
        Node::new(
            Flavor::State,
            Behavior::Derived(Box::new(|_| Ok(None))),
            owner,
            Some(value_eq::<i32>),
            None,
        )
    }

    pub(crate) fn input(owner: ScopeId, value: i32) -> Node {
        Node::new(
            Flavor::State,
            Behavior::Input,
            owner,
            Some(value_eq::<i32>),
            Some(Arc::new(value)),
        )
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn nodes_start_inactive() {
        let scope = ScopeId::new();
        let node = input(scope, 3);
        assert_eq!(node.kind(), NodeKind::Input);
        assert_eq!(node.state(), ActivationState::Inactive);
        assert_eq!(node.refs(), 0);
        assert!(node.retains_value());
        assert!(!derived(scope).retains_value());
    }

    #[test]
    fn dependency_management() {
        let mut node = derived(ScopeId::new());
        let dep1 = NodeId::new();
        let dep2 = NodeId::new();

        node.add_dependency(dep1);
        node.add_dependency(dep2);
        node.add_dependency(dep1);

        assert_eq!(node.dependencies(), &[dep1, dep2, dep1]);

        node.remove_dependency(dep1);
        assert_eq!(node.dependencies(), &[dep1, dep2]);
        assert!(node.depends_on(dep1));

        node.remove_dependency(dep1);
        assert!(!node.depends_on(dep1));
    }

    #[test]
    fn ref_counts_never_underflow() {
        let mut node = derived(ScopeId::new());
        assert_eq!(node.increment_refs(), 1);
        assert_eq!(node.decrement_refs(), Some(0));
        assert_eq!(node.decrement_refs(), None);
        assert_eq!(node.refs(), 0);
    }

    #[test]
    fn differs_uses_value_equality() {
        let node = input(ScopeId::new(), 5);
        assert!(!node.differs(&(Arc::new(5) as Value)));
        assert!(node.differs(&(Arc::new(6) as Value)));
        // A value of the wrong type is never equal.
        assert!(node.differs(&(Arc::new("5") as Value)));
    }

    #[test]
    fn inputs_expose_changed_slots() {
        let slots = vec![
            Slot { value: Some(Arc::new(1_i32)), changed: false },
            Slot { value: Some(Arc::new(2_i32)), changed: true },
            Slot { value: None, changed: false },
        ];
        let inputs = Inputs::new(&slots, None);

        assert_eq!(inputs.get::<i32>(0), Ok(&1));
        assert!(inputs.get::<i32>(2).is_err());
        assert!(inputs.get::<u8>(0).is_err());
        assert_eq!(inputs.fired::<i32>(0), None);
        assert_eq!(inputs.fired::<i32>(1), Some(&2));
        assert!(inputs.changed(1));
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs.prev::<i32>(), None);
    }
}
