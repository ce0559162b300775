//! Network Runtime
//!
//! The runtime is the entry point that connects handles, the queue, and the
//! transaction engine. Every handle holds a [`Network`], which is an `Arc`
//! over the shared state:
//!
//! - the graph, behind a `parking_lot` mutex
//! - the queue of pending write batches and boundary messages, behind a
//!   second mutex that is never held together with the graph lock
//! - the drain flag: at most one thread drains at a time, and writes that
//!   arrive while a drain is running are picked up by that drain
//!
//! # Drain modes
//!
//! In [`DrainMode::Immediate`] the call that enqueues work drains it before
//! returning, unless a drain is already running. In [`DrainMode::Manual`]
//! nothing runs until [`Network::run_until_quiescent`]. In
//! [`DrainMode::Background`] the driver task spawned by [`Network::launch`]
//! drains whenever work is enqueued.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::config::{DrainMode, NetworkConfig};
use crate::error::{Error, Result};
use crate::graph::{ActivationState, Behavior, EqFn, Flavor, Node, NodeId, Value};
use crate::reactive::context::ReactiveContext;
use crate::reactive::observer::Callback;
use crate::reactive::scope::{CloseHook, ScopeGuard};
use crate::reactive::{
    CellData, Data, EventInput, ObserverHandle, ObserverId, PendingWrite, ScopeHandle, ScopeId,
    StateInput,
};

use super::graph::{Boundary, Graph, LifecycleEvent};
use super::NetworkId;

pub(crate) type LifecycleListener = dyn Fn(&LifecycleEvent) + Send + Sync;

pub(crate) struct Shared {
    pub(crate) id: NetworkId,
    pub(crate) config: NetworkConfig,
    pub(crate) root: ScopeId,
    pub(crate) graph: Mutex<Graph>,
    queue: Mutex<Queue>,
    wakeup: Notify,
    closed: watch::Sender<bool>,
    pub(crate) listener: Mutex<Option<Arc<LifecycleListener>>>,
    pub(crate) seq: AtomicU64,
}

#[derive(Default)]
struct Queue {
    batches: VecDeque<Vec<PendingWrite>>,
    messages: Vec<Boundary>,

    /// Run a transaction even if nothing is queued: there are attached
    /// observers waiting for their first delivery.
    needs_tick: bool,

    draining: bool,
    shutdown_requested: bool,
    shut_down: bool,
}

/// What a transaction was started for.
pub(crate) enum Work {
    Writes(Vec<PendingWrite>),
    Tick,
}

/// A reactive dataflow network.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use weft_core::{Network, NetworkConfig};
///
/// let network = Network::new(NetworkConfig::default());
/// let x = network.state_input(0);
/// let y = x.state().map(|v| v * 2);
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let observer = y.observe(move |v| sink.lock().unwrap().push(*v));
///
/// x.set(5).unwrap();
/// observer.cancel().unwrap();
/// x.set(99).unwrap();
///
/// assert_eq!(*seen.lock().unwrap(), vec![0, 10]);
/// ```
#[derive(Clone)]
pub struct Network {
    pub(crate) inner: Arc<Shared>,
}

/// A network reference that does not keep the network alive.
#[derive(Clone)]
pub(crate) struct WeakNetwork(Weak<Shared>);

impl WeakNetwork {
    pub(crate) fn upgrade(&self) -> Option<Network> {
        self.0.upgrade().map(|inner| Network { inner })
    }
}

/// The writes of one transaction, collected by [`Network::transaction`].
#[derive(Debug, Default)]
pub struct Batch {
    writes: Vec<PendingWrite>,
}

impl Batch {
    pub fn set<T: CellData>(&mut self, input: &StateInput<T>, value: T) -> &mut Self {
        self.push(input.write(value))
    }

    pub fn update<T, F>(&mut self, input: &StateInput<T>, f: F) -> &mut Self
    where
        T: CellData,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.push(input.write_update(f))
    }

    pub fn emit<T: Data>(&mut self, input: &EventInput<T>, value: T) -> &mut Self {
        self.push(input.write(value))
    }

    pub fn push(&mut self, write: PendingWrite) -> &mut Self {
        self.writes.push(write);
        self
    }
}

impl Network {
    /// Create a network. No task is spawned; in background mode use
    /// [`Network::launch`] instead.
    pub fn new(config: NetworkConfig) -> Self {
        let graph = Graph::new();
        let root = graph.root();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Shared {
                id: NetworkId::new(),
                config,
                root,
                graph: Mutex::new(graph),
                queue: Mutex::new(Queue::default()),
                wakeup: Notify::new(),
                closed,
                listener: Mutex::new(None),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Create a network bound to `lifetime`.
    ///
    /// A driver task is spawned on the current Tokio runtime. When
    /// `lifetime` completes the task shuts the network down, which tears
    /// down everything still active. In [`DrainMode::Background`] the same
    /// task drains the queue.
    pub fn launch<F>(config: NetworkConfig, lifetime: F) -> Result<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let network = Self::new(config);
        let driver = network.clone();
        runtime.spawn(async move { driver.drive(lifetime).await });
        Ok(network)
    }

    async fn drive<F: Future<Output = ()>>(self, lifetime: F) {
        let background = self.inner.config.drain_mode == DrainMode::Background;
        tokio::pin!(lifetime);
        loop {
            tokio::select! {
                _ = &mut lifetime => break,
                _ = self.closed() => return,
                _ = self.inner.wakeup.notified(), if background => {
                    match self.drain() {
                        Ok(()) | Err(Error::ReentrantDrain) => {}
                        Err(err) => {
                            tracing::error!(network = %self.inner.config.name, error = %err, "background drain failed");
                        }
                    }
                }
            }
        }
        if let Err(err) = self.shutdown() {
            tracing::error!(network = %self.inner.config.name, error = %err, "shutdown failed");
        }
    }

    pub fn id(&self) -> NetworkId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakNetwork {
        WeakNetwork(Arc::downgrade(&self.inner))
    }

    // Scopes

    /// The scope new nodes and observers belong to on this thread.
    pub(crate) fn ambient_scope(&self) -> ScopeId {
        ReactiveContext::current_scope(self.id()).unwrap_or(self.inner.root)
    }

    /// Open a scope nested in the ambient scope.
    pub fn open_scope(&self) -> Result<ScopeHandle> {
        self.open_scope_in(Some(self.ambient_scope()))
    }

    pub(crate) fn open_scope_in(&self, parent: Option<ScopeId>) -> Result<ScopeHandle> {
        let id = self.inner.graph.lock().open_scope(parent)?;
        Ok(ScopeHandle::new(self.clone(), id))
    }

    pub(crate) fn retain_scope(&self, id: ScopeId) -> Result<()> {
        self.inner.graph.lock().retain_scope(id)
    }

    pub(crate) fn close_scope(&self, id: ScopeId) -> Result<()> {
        let last = self.inner.graph.lock().release_scope(id)?;
        if last {
            self.post(Boundary::Close(id))?;
        }
        Ok(())
    }

    pub(crate) fn add_close_hook(&self, id: ScopeId, hook: CloseHook) -> Result<()> {
        self.inner.graph.lock().add_close_hook(id, hook)
    }

    pub(crate) fn scope_is_open(&self, id: ScopeId) -> bool {
        self.inner.graph.lock().scope_is_open(id)
    }

    /// Run `block` in a fresh scope and close the scope when the block
    /// returns or unwinds.
    pub fn activate<R>(&self, block: impl FnOnce(&ScopeHandle) -> R) -> Result<R> {
        let guard = ScopeGuard::new(self.open_scope()?);
        let value = guard.handle().enter(|| block(guard.handle()));
        guard.finish()?;
        Ok(value)
    }

    /// Run `block` in a fresh scope and keep the scope open until `until`
    /// completes. Dropping the returned future also closes the scope.
    pub async fn activate_until<R, F>(&self, block: impl FnOnce(&ScopeHandle) -> R, until: F) -> Result<R>
    where
        F: Future,
    {
        let guard = ScopeGuard::new(self.open_scope()?);
        let value = guard.handle().enter(|| block(guard.handle()));
        until.await;
        guard.finish()?;
        Ok(value)
    }

    // Nodes and observers

    pub(crate) fn add_node(
        &self,
        flavor: Flavor,
        behavior: Behavior,
        eq: Option<EqFn>,
        value: Option<Value>,
        upstream: &[NodeId],
    ) -> NodeId {
        let node = Node::new(flavor, behavior, self.ambient_scope(), eq, value);
        if ReactiveContext::is_propagating(self.id()) {
            tracing::warn!(node = %node.id(), "node created inside a derivation is discarded");
            return node.id();
        }
        self.inner.graph.lock().insert(node, upstream)
    }

    pub(crate) fn register_observer(&self, node: NodeId, callback: Callback) -> ObserverHandle {
        if ReactiveContext::is_propagating(self.id()) {
            tracing::warn!(node = %node, "observer registered inside a derivation is discarded");
            return ObserverHandle::new(self.clone(), ObserverId::new(), Arc::new(AtomicBool::new(true)));
        }
        let (handle, attached) = self.attach_observer(node, callback);
        if let Err(err) = attached {
            tracing::warn!(observer = %handle.id(), error = %err, "drain after attach failed");
        }
        handle
    }

    /// Like [`Network::register_observer`], but a failed attach is returned
    /// instead of logged. Nothing stays attached on error.
    pub(crate) fn try_register_observer(&self, node: NodeId, callback: Callback) -> Result<ObserverHandle> {
        if ReactiveContext::is_propagating(self.id()) {
            return Err(Error::ObserveDuringPropagation(node));
        }
        let (handle, attached) = self.attach_observer(node, callback);
        let Err(err) = attached else {
            return Ok(handle);
        };
        if !handle.is_cancelled() {
            if let Err(cancel) = handle.cancel() {
                tracing::debug!(observer = %handle.id(), error = %cancel, "cancel after failed attach");
            }
        }
        Err(err)
    }

    fn attach_observer(&self, node: NodeId, callback: Callback) -> (ObserverHandle, Result<()>) {
        let scope = self.ambient_scope();
        let (id, cancelled, registered) = self
            .inner
            .graph
            .lock()
            .register_observer(node, scope, callback);
        let attached = if registered {
            self.post(Boundary::Attach(id))
        } else {
            Err(Error::ScopeClosed(scope))
        };
        (ObserverHandle::new(self.clone(), id, cancelled), attached)
    }

    pub(crate) fn request_detach(&self, id: ObserverId) -> Result<()> {
        self.post(Boundary::Detach(id))
    }

    pub(crate) fn sample_value(&self, id: NodeId) -> Result<Value> {
        if ReactiveContext::is_propagating(self.id()) {
            return Err(Error::SampleDuringPropagation(id));
        }
        let graph = self.inner.graph.lock();
        let node = graph
            .nodes
            .get_node(id)
            .filter(|node| !node.is_disposed())
            .ok_or(Error::Disposed(id))?;
        let inactive = Error::Inactive {
            node: id,
            state: node.state(),
        };
        if !node.retains_value() && !node.is_active() {
            return Err(inactive);
        }
        node.value().cloned().ok_or(inactive)
    }

    // Introspection

    pub fn activation_state(&self, id: NodeId) -> Option<ActivationState> {
        self.inner.graph.lock().activation_state(id)
    }

    /// Number of nodes currently in the graph.
    pub fn node_count(&self) -> usize {
        self.inner.graph.lock().nodes.node_count()
    }

    /// Number of write batches waiting to run.
    pub fn pending_transactions(&self) -> usize {
        self.inner.queue.lock().batches.len()
    }

    /// Receive every node lifecycle transition, after the transaction that
    /// caused it.
    pub fn set_lifecycle_listener<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        *self.inner.listener.lock() = Some(Arc::new(listener));
    }

    // Transactions

    /// Enqueue one batch of writes and drain according to the drain mode.
    pub fn run_transaction(&self, writes: Vec<PendingWrite>) -> Result<()> {
        self.submit(writes)
    }

    /// Collect writes with `build` and run them as one transaction.
    pub fn transaction(&self, build: impl FnOnce(&mut Batch)) -> Result<()> {
        let mut batch = Batch::default();
        build(&mut batch);
        self.submit(batch.writes)
    }

    /// Enqueue one batch without draining.
    pub fn enqueue(&self, writes: Vec<PendingWrite>) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        if queue.shut_down || queue.shutdown_requested {
            return Err(Error::ShutDown);
        }
        queue.batches.push_back(writes);
        Ok(())
    }

    pub(crate) fn submit(&self, writes: Vec<PendingWrite>) -> Result<()> {
        self.enqueue(writes)?;
        self.after_enqueue()
    }

    /// Run every queued transaction, and the transactions their epilogues
    /// enqueue, on this thread.
    pub fn run_until_quiescent(&self) -> Result<()> {
        self.drain()
    }

    fn post(&self, message: Boundary) -> Result<()> {
        {
            let mut queue = self.inner.queue.lock();
            if queue.shut_down {
                return Ok(());
            }
            queue.messages.push(message);
        }
        self.after_enqueue()
    }

    fn after_enqueue(&self) -> Result<()> {
        match self.inner.config.drain_mode {
            DrainMode::Immediate => match self.drain() {
                Err(Error::ReentrantDrain) => Ok(()),
                other => other,
            },
            DrainMode::Manual => Ok(()),
            DrainMode::Background => {
                self.inner.wakeup.notify_one();
                Ok(())
            }
        }
    }

    fn drain(&self) -> Result<()> {
        {
            let mut queue = self.inner.queue.lock();
            if queue.draining {
                return Err(Error::ReentrantDrain);
            }
            if queue.shut_down {
                return Ok(());
            }
            queue.draining = true;
        }

        let result = self.drain_queue();

        let finish = {
            let mut queue = self.inner.queue.lock();
            if result.is_err() {
                queue.draining = false;
            }
            queue.shutdown_requested && !queue.shut_down && !queue.draining
        };
        if finish {
            self.finish_shutdown();
        }
        result
    }

    /// Run transactions until the queue is empty. The drain flag is cleared
    /// under the same lock that finds the queue empty.
    fn drain_queue(&self) -> Result<()> {
        let limit = self.inner.config.max_transactions_per_drain;
        let mut ran = 0;
        while let Some((work, messages)) = self.next_work() {
            if ran == limit {
                self.requeue(work, messages);
                return Err(Error::DrainLimit(limit));
            }
            ran += 1;
            self.run_unit(work, messages)?;
        }
        Ok(())
    }

    fn next_work(&self) -> Option<(Work, Vec<Boundary>)> {
        let mut queue = self.inner.queue.lock();
        let messages = std::mem::take(&mut queue.messages);
        let work = match queue.batches.pop_front() {
            Some(batch) => Work::Writes(batch),
            None if !messages.is_empty() || queue.needs_tick => Work::Tick,
            None => {
                queue.draining = false;
                return None;
            }
        };
        queue.needs_tick = false;
        Some((work, messages))
    }

    fn requeue(&self, work: Work, messages: Vec<Boundary>) {
        let mut queue = self.inner.queue.lock();
        match work {
            Work::Writes(batch) => queue.batches.push_front(batch),
            Work::Tick => queue.needs_tick = true,
        }
        let later = std::mem::replace(&mut queue.messages, messages);
        queue.messages.extend(later);
    }

    /// Boundary messages posted since the transaction started.
    pub(crate) fn take_messages(&self) -> Vec<Boundary> {
        std::mem::take(&mut self.inner.queue.lock().messages)
    }

    pub(crate) fn request_tick(&self) {
        self.inner.queue.lock().needs_tick = true;
    }

    // Lifetime

    /// Close the root scope and drain, so every subscription is torn down
    /// before this returns. Later writes report [`Error::ShutDown`].
    ///
    /// Called from inside a callback, the shutdown completes when the
    /// running drain does.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = self.inner.queue.lock();
            if queue.shut_down || queue.shutdown_requested {
                return Ok(());
            }
            queue.shutdown_requested = true;
            queue.messages.push(Boundary::Close(self.inner.root));
        }
        self.inner.graph.lock().begin_close(self.inner.root);

        match self.drain() {
            Err(Error::ReentrantDrain) => Ok(()),
            other => other,
        }
    }

    fn finish_shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.shut_down {
                return;
            }
            queue.shut_down = true;
            queue.batches.clear();
            queue.messages.clear();
            queue.needs_tick = false;
        }
        let running = self.inner.graph.lock().clear();
        drop(running);
        self.inner.closed.send_replace(true);
        tracing::debug!(network = %self.inner.config.name, "network shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.queue.lock().shut_down
    }

    /// Resolves once the network has shut down.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // The sender lives in the shared state, so this only fails if the
        // network is gone, which also counts as closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .finish()
    }
}
