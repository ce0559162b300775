//! Roots of the graph
//!
//! Everything that changes in a network starts at a root:
//!
//! - [`StateInput`]: a mutable cell whose `set` enqueues a pending write
//! - [`EventInput`]: a stream whose `emit` enqueues an occurrence
//! - external sources: cells or streams fed by a callback adapter that
//!   subscribes when the node activates and unsubscribes when it
//!   deactivates (see [`Network::external_events`])
//!
//! Writes never run propagation directly. They are queued and applied by
//! the next transaction, on whichever thread drains the network.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{value_eq, Behavior, Flavor, NodeId, Value};
use crate::network::{Network, WeakNetwork};

use super::events::Events;
use super::state::State;
use super::{CellData, Data};

/// A write waiting for its transaction.
pub struct PendingWrite {
    pub(crate) node: NodeId,
    pub(crate) op: WriteOp,
}

pub(crate) type ModifyFn = dyn Fn(&Value) -> Option<Value> + Send + Sync;

pub(crate) enum WriteOp {
    /// Replace the value, or fire the occurrence.
    Set(Value),

    /// Derive the new value from the value as of this point in the batch.
    Modify(Arc<ModifyFn>),
}

impl PendingWrite {
    pub(crate) fn set<T: Data>(node: NodeId, value: T) -> Self {
        Self {
            node,
            op: WriteOp::Set(Arc::new(value)),
        }
    }

    /// The root this write targets.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            WriteOp::Set(_) => "set",
            WriteOp::Modify(_) => "modify",
        };
        f.debug_struct("PendingWrite")
            .field("node", &self.node)
            .field("op", &op)
            .finish()
    }
}

/// Teardown for an external subscription.
///
/// The teardown runs once: when the node deactivates, or when the
/// subscription is dropped without having been torn down.
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self { teardown: None }
    }

    /// Run the teardown now.
    pub fn unsubscribe(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("armed", &self.teardown.is_some())
            .finish()
    }
}

/// Start hook of an external source, erased over its value type.
pub(crate) type StartFn = dyn Fn(WeakNetwork, NodeId) -> Subscription + Send + Sync;

/// Pushes values from an external callback into a root.
///
/// Emitters only hold a weak reference to their network; emitting after
/// the network is gone reports [`Error::ShutDown`]. Emitting after the
/// source was deactivated is accepted and dropped by the next transaction.
pub struct Emitter<T> {
    network: WeakNetwork,
    node: NodeId,
    _marker: PhantomData<fn(T)>,
}

impl<T: Data> Emitter<T> {
    pub(crate) fn new(network: WeakNetwork, node: NodeId) -> Self {
        Self {
            network,
            node,
            _marker: PhantomData,
        }
    }

    /// The node this emitter feeds.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Enqueue a value (cells) or occurrence (streams).
    pub fn emit(&self, value: T) -> Result<()> {
        let network = self.network.upgrade().ok_or(Error::ShutDown)?;
        network.submit(vec![PendingWrite::set(self.node, value)])
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            node: self.node,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("node", &self.node).finish()
    }
}

/// A mutable root cell.
///
/// # Example
///
/// ```rust
/// use weft_core::{Network, NetworkConfig};
///
/// let network = Network::new(NetworkConfig::default());
/// let count = network.state_input(0);
///
/// count.set(5).unwrap();
/// assert_eq!(count.sample().unwrap(), 5);
///
/// count.update(|v| v + 1).unwrap();
/// assert_eq!(count.sample().unwrap(), 6);
/// ```
pub struct StateInput<T> {
    state: State<T>,
}

impl<T: CellData> StateInput<T> {
    /// The cell this input writes to.
    pub fn state(&self) -> &State<T> {
        &self.state
    }

    pub fn id(&self) -> NodeId {
        self.state.id()
    }

    /// Schedule a new value.
    pub fn set(&self, value: T) -> Result<()> {
        self.state.network().submit(vec![self.write(value)])
    }

    /// Schedule a new value computed from the value current at the time
    /// the write is applied.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.state.network().submit(vec![self.write_update(f)])
    }

    /// A write setting this input, for use in a batch.
    pub fn write(&self, value: T) -> PendingWrite {
        PendingWrite::set(self.id(), value)
    }

    /// A write updating this input, for use in a batch.
    pub fn write_update<F>(&self, f: F) -> PendingWrite
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        PendingWrite {
            node: self.id(),
            op: WriteOp::Modify(Arc::new(move |value: &Value| {
                value
                    .downcast_ref::<T>()
                    .map(|current| Arc::new(f(current)) as Value)
            })),
        }
    }

    /// The committed value.
    pub fn sample(&self) -> Result<T> {
        self.state.sample()
    }
}

impl<T> Clone for StateInput<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for StateInput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateInput")
            .field("id", &self.state.id())
            .finish()
    }
}

/// A root stream fired explicitly.
pub struct EventInput<T> {
    events: Events<T>,
}

impl<T: Data> EventInput<T> {
    /// The stream this input fires.
    pub fn events(&self) -> &Events<T> {
        &self.events
    }

    pub fn id(&self) -> NodeId {
        self.events.id()
    }

    /// Schedule an occurrence. Occurrences on an inactive stream are
    /// dropped.
    pub fn emit(&self, value: T) -> Result<()> {
        self.events.network().submit(vec![self.write(value)])
    }

    /// A write firing this input, for use in a batch.
    pub fn write(&self, value: T) -> PendingWrite {
        PendingWrite::set(self.id(), value)
    }
}

impl<T> Clone for EventInput<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T> fmt::Debug for EventInput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInput")
            .field("id", &self.events.id())
            .finish()
    }
}

fn erase_start<T, F>(start: F) -> Arc<StartFn>
where
    T: Data,
    F: Fn(Emitter<T>) -> Subscription + Send + Sync + 'static,
{
    Arc::new(move |network: WeakNetwork, node: NodeId| start(Emitter::new(network, node)))
}

impl Network {
    /// Create a mutable root cell.
    pub fn state_input<T: CellData>(&self, initial: T) -> StateInput<T> {
        let id = self.add_node(
            Flavor::State,
            Behavior::Input,
            Some(value_eq::<T>),
            Some(Arc::new(initial)),
            &[],
        );
        StateInput {
            state: State::from_id(self.clone(), id),
        }
    }

    /// Create a root stream.
    pub fn event_input<T: Data>(&self) -> EventInput<T> {
        let id = self.add_node(Flavor::Events, Behavior::Input, None, None, &[]);
        EventInput {
            events: Events::from_id(self.clone(), id),
        }
    }

    /// Create a stream fed by an external callback.
    ///
    /// `start` runs every time the stream activates and returns the
    /// subscription that is torn down when the stream deactivates.
    ///
    /// ```rust
    /// use std::sync::{Arc, Mutex};
    /// use weft_core::{Emitter, Network, NetworkConfig, Subscription};
    ///
    /// let network = Network::new(NetworkConfig::default());
    /// let registered: Arc<Mutex<Option<Emitter<u32>>>> = Arc::default();
    ///
    /// let slot = Arc::clone(&registered);
    /// let levels = network.external_events(move |emitter: Emitter<u32>| {
    ///     *slot.lock().unwrap() = Some(emitter);
    ///     let slot = Arc::clone(&slot);
    ///     Subscription::new(move || *slot.lock().unwrap() = None)
    /// });
    ///
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let sink = Arc::clone(&seen);
    /// let observer = levels.observe(move |level| sink.lock().unwrap().push(*level));
    ///
    /// let emitter = registered.lock().unwrap().clone().unwrap();
    /// emitter.emit(3).unwrap();
    /// assert_eq!(*seen.lock().unwrap(), vec![3]);
    ///
    /// observer.cancel().unwrap();
    /// assert!(registered.lock().unwrap().is_none());
    /// ```
    pub fn external_events<T, F>(&self, start: F) -> Events<T>
    where
        T: Data,
        F: Fn(Emitter<T>) -> Subscription + Send + Sync + 'static,
    {
        let behavior = Behavior::External {
            initial: None,
            start: erase_start(start),
            running: None,
        };
        let id = self.add_node(Flavor::Events, behavior, None, None, &[]);
        Events::from_id(self.clone(), id)
    }

    /// Create a cell fed by an external callback.
    ///
    /// On every activation the cell starts from `initial`; the callback is
    /// expected to emit the current value once subscribed.
    pub fn external_state<T, F>(&self, initial: T, start: F) -> State<T>
    where
        T: CellData,
        F: Fn(Emitter<T>) -> Subscription + Send + Sync + 'static,
    {
        let behavior = Behavior::External {
            initial: Some(Arc::new(initial)),
            start: erase_start(start),
            running: None,
        };
        let id = self.add_node(Flavor::State, behavior, Some(value_eq::<T>), None, &[]);
        State::from_id(self.clone(), id)
    }
}
