//! Transaction Engine
//!
//! One call to [`Network::run_unit`] is one transaction. The graph lock is
//! held while values are computed and released around every piece of user
//! code that may touch the network again: start hooks, build
//! specifications, observer callbacks, teardowns and `on_close` hooks.
//!
//! Values computed by the transaction go to a staging area first. Nothing
//! is committed unless every derivation succeeds, so a failure leaves all
//! cells as they were.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::error::{panic_message, Error, Result};
use crate::graph::{ActivationState, Behavior, DeriveFn, Inputs, NodeId, NodeKind, Slot, UpdateScheduler, Value};
use crate::reactive::context::ReactiveContext;
use crate::reactive::input::{Subscription, WriteOp};
use crate::reactive::observer::{Callback, ObserverStatus};
use crate::reactive::scope::CloseHook;
use crate::reactive::spec::{BranchSlot, Resolver, SwitchState};
use crate::reactive::{PendingWrite, ScopeHandle};

use super::graph::{Boundary, Graph, LifecycleEvent, Transition};
use super::runtime::{Network, Work};

/// Values produced by one transaction, in the order they were produced.
#[derive(Default)]
struct Staging {
    values: HashMap<NodeId, Value>,
    order: Vec<NodeId>,
}

impl Staging {
    fn stage(&mut self, id: NodeId, value: Value) {
        if self.values.insert(id, value).is_none() {
            self.order.push(id);
        }
    }
}

/// A propagation pass. It stops at a switch that is missing a branch and
/// resumes there once the branch is wired in.
struct Pass {
    staging: Staging,
    order: Vec<NodeId>,
    next: usize,
}

impl Pass {
    /// Merge nodes activated mid-pass into the part of the order that has
    /// not run yet.
    fn admit(&mut self, nodes: &UpdateScheduler, fresh: &IndexSet<NodeId>) -> Result<()> {
        if fresh.is_empty() {
            return Ok(());
        }
        let mut rest = self.order.split_off(self.next);
        let queued: HashSet<NodeId> = rest.iter().copied().collect();
        rest.extend(fresh.iter().copied().filter(|id| !queued.contains(id)));
        let sorted = nodes.topological_sort(rest).map_err(Error::Cycle)?;
        self.order.extend(sorted);
        Ok(())
    }
}

/// Why a pass stopped early.
enum Interrupt {
    Fail(Error),

    /// A node failed to compute its initial value.
    Abort { node: NodeId, error: Error },

    /// A switch needs a branch for `key` before the pass can continue.
    Splice { switch: NodeId, key: Value },
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Fail(err)
    }
}

struct Delivery {
    callback: Callback,
    value: Value,
    cancelled: Arc<AtomicBool>,
}

type GraphGuard<'a> = MutexGuard<'a, Graph>;

impl Network {
    pub(crate) fn run_unit(&self, work: Work, messages: Vec<Boundary>) -> Result<()> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("transaction", network = %self.inner.config.name, seq);
        let _entered = span.enter();

        let writes = match work {
            Work::Writes(writes) => writes,
            Work::Tick => Vec::new(),
        };
        let (attaches, deferred): (Vec<_>, Vec<_>) = messages
            .into_iter()
            .partition(|message| matches!(message, Boundary::Attach(_)));

        let mut errors = Vec::new();
        let mut graph = self.inner.graph.lock();
        for message in attaches {
            if let Boundary::Attach(id) = message {
                if let Err(err) = graph.attach(id) {
                    errors.push(err);
                }
            }
        }

        let deliveries = match self.settle(&mut graph, &writes, &mut errors) {
            Ok(staging) => {
                commit(&mut graph, &staging);
                collect_deliveries(&mut graph, &staging)
            }
            Err(err) => {
                tracing::debug!(error = %err, "transaction failed; staging discarded");
                graph.abandon_pending();
                errors.insert(0, err);
                Vec::new()
            }
        };
        drop(graph);

        let panicked = deliver(deliveries);

        // Attaches posted by callbacks come first; settle_boundary orders
        // the rest.
        let mut boundary = self.take_messages();
        boundary.extend(deferred);
        let mut graph = self.inner.graph.lock();
        let attached = graph.settle_boundary(boundary, &mut errors);
        let (teardowns, hooks) = graph.take_cleanup();
        drop(graph);

        run_cleanup(teardowns, hooks);

        let transitions = {
            let mut graph = self.inner.graph.lock();
            graph.finish_deactivation();
            graph.take_transitions()
        };
        self.notify_lifecycle(&transitions);

        if attached {
            self.request_tick();
        }
        if let Some(message) = panicked {
            errors.push(Error::ObserverPanicked(message));
        }
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Activate what the boundary retained, then propagate the writes,
    /// splicing in branches until no switch is missing one.
    ///
    /// A node that fails to activate takes the attaches that reached it
    /// down with it; their errors go to `errors` and the transaction goes
    /// on without them.
    fn settle(&self, graph: &mut GraphGuard<'_>, writes: &[PendingWrite], errors: &mut Vec<Error>) -> Result<Staging> {
        let mut rounds = 0;
        loop {
            let step = match self.start_sources(graph) {
                Ok(()) => self.materialize(graph),
                Err((node, error)) => Err(Interrupt::Abort { node, error }),
            };
            let (node, error) = match step {
                Ok(()) => break,
                Err(Interrupt::Fail(error)) => return Err(error),
                Err(Interrupt::Abort { node, error }) => (node, error),
                Err(Interrupt::Splice { switch, key }) => match self.splice_round(graph, &mut rounds, switch, key) {
                    Ok(()) => continue,
                    Err(error) => (switch, error),
                },
            };
            if !graph.abort_activation(node)? {
                return Err(error);
            }
            errors.push(error);
        }

        let mut pass = self.begin_pass(graph, writes)?;
        loop {
            let (switch, key) = match self.propagate(graph, &mut pass) {
                Ok(()) => return Ok(pass.staging),
                Err(Interrupt::Splice { switch, key }) => (switch, key),
                Err(Interrupt::Fail(error) | Interrupt::Abort { error, .. }) => return Err(error),
            };
            self.splice_round(graph, &mut rounds, switch, key)?;
            self.start_sources(graph).map_err(|(_, error)| error)?;
            pass.admit(&graph.nodes, &graph.activating)?;
        }
    }

    fn splice_round(&self, graph: &mut GraphGuard<'_>, rounds: &mut usize, switch: NodeId, key: Value) -> Result<()> {
        let limit = self.inner.config.max_splice_rounds;
        *rounds += 1;
        if *rounds > limit {
            return Err(Error::SpliceLimit {
                node: switch,
                rounds: limit,
            });
        }
        // A switch that is still activating takes the branch as current;
        // an active one holds it as pending until commit.
        let activating = graph.activating.contains(&switch);
        self.splice(graph, switch, key, activating)
    }

    /// Run the start hook of every external source that just activated.
    fn start_sources(&self, graph: &mut GraphGuard<'_>) -> std::result::Result<(), (NodeId, Error)> {
        let pending: Vec<_> = graph
            .activating
            .iter()
            .filter_map(|id| match graph.nodes.get_node(*id).map(|node| &node.behavior) {
                Some(Behavior::External {
                    start,
                    running: None,
                    ..
                }) => Some((*id, Arc::clone(start))),
                _ => None,
            })
            .collect();

        for (id, start) in pending {
            let network = self.downgrade();
            let started = MutexGuard::unlocked(graph, || {
                catch_unwind(AssertUnwindSafe(|| start(network, id)))
            });
            let subscription = started.map_err(|payload| {
                let error = Error::SourceFailed {
                    node: id,
                    message: panic_message(payload),
                };
                (id, error)
            })?;
            tracing::debug!(node = %id, "external source started");

            let mut subscription = Some(subscription);
            if let Some(node) = graph.nodes.get_node_mut(id) {
                if node.state() == ActivationState::Activating {
                    if let Behavior::External { running, .. } = &mut node.behavior {
                        *running = subscription.take();
                    }
                }
            }
            // Released while its hook ran.
            if let Some(orphan) = subscription {
                graph.defer_teardown(orphan);
            }
        }
        Ok(())
    }

    /// Give every activating node its initial value from committed
    /// upstream values.
    fn materialize(&self, graph: &mut GraphGuard<'_>) -> std::result::Result<(), Interrupt> {
        let pending: Vec<NodeId> = graph.activating.iter().copied().collect();
        if pending.is_empty() {
            return Ok(());
        }
        let _pass = ReactiveContext::enter_propagation(self.id());
        let order = graph.nodes.topological_sort(pending).map_err(Error::Cycle)?;
        let mut staging = Staging::default();
        for id in order {
            match materialize_node(graph, id, &mut staging) {
                Err(Interrupt::Fail(error)) => return Err(Interrupt::Abort { node: id, error }),
                other => other?,
            }
        }
        Ok(())
    }

    /// Apply the batch's writes and order the nodes they affect.
    fn begin_pass(&self, graph: &mut GraphGuard<'_>, writes: &[PendingWrite]) -> Result<Pass> {
        let _pass = ReactiveContext::enter_propagation(self.id());
        let mut staging = Staging::default();
        let mut roots: Vec<NodeId> = Vec::new();

        for write in writes {
            let Some(node) = graph.nodes.get_node(write.node).filter(|node| !node.is_disposed()) else {
                tracing::debug!(node = %write.node, "write to a disposed node dropped");
                continue;
            };
            let accepts = match node.kind() {
                NodeKind::Input => node.is_state() || node.is_active(),
                NodeKind::External => node.is_active(),
                _ => false,
            };
            if !accepts {
                tracing::debug!(node = %write.node, state = ?node.state(), "write to an inactive node dropped");
                continue;
            }
            let value = match &write.op {
                WriteOp::Set(value) => Arc::clone(value),
                WriteOp::Modify(modify) => {
                    let current = staging.values.get(&write.node).or(node.value());
                    match current.and_then(|current| modify(current)) {
                        Some(value) => value,
                        None => {
                            tracing::debug!(node = %write.node, "update of a node without a value dropped");
                            continue;
                        }
                    }
                }
            };
            if !roots.contains(&write.node) {
                roots.push(write.node);
            }
            staging.values.insert(write.node, value);
        }

        for root in roots {
            let unchanged = match (graph.nodes.get_node(root), staging.values.get(&root)) {
                (Some(node), Some(value)) => node.is_state() && !node.differs(value),
                _ => true,
            };
            if unchanged {
                staging.values.remove(&root);
            } else {
                staging.order.push(root);
            }
        }

        let order = if staging.order.is_empty() {
            Vec::new()
        } else {
            graph.nodes.affected(&staging.order).map_err(Error::Cycle)?
        };
        Ok(Pass {
            staging,
            order,
            next: 0,
        })
    }

    /// Run the pass from where it stopped. Each node runs at most once.
    fn propagate(&self, graph: &mut GraphGuard<'_>, pass: &mut Pass) -> std::result::Result<(), Interrupt> {
        let _pass = ReactiveContext::enter_propagation(self.id());
        while let Some(&id) = pass.order.get(pass.next) {
            if graph.activating.contains(&id) {
                materialize_node(graph, id, &mut pass.staging)?;
            } else {
                rederive(graph, id, &mut pass.staging)?;
            }
            pass.next += 1;
        }
        Ok(())
    }

    /// Resolve the branch a switch is missing and wire it in.
    fn splice(&self, graph: &mut GraphGuard<'_>, switch: NodeId, key: Value, activating: bool) -> Result<()> {
        let (resolver, owner) = match graph.nodes.get_node(switch) {
            Some(node) => match &node.behavior {
                Behavior::Switch(state) => (state.resolver.clone(), node.owner()),
                _ => return Err(Error::Disposed(switch)),
            },
            None => return Err(Error::Disposed(switch)),
        };

        let slot = match resolver {
            Resolver::Follow(follow) => {
                let output = follow(&key).ok_or_else(|| Error::Derivation {
                    node: switch,
                    message: "selector does not hold a cell".to_string(),
                })?;
                BranchSlot {
                    key,
                    output,
                    scope: None,
                }
            }
            Resolver::Build(build) => {
                let scope = graph.open_scope(Some(owner))?;
                let handle = ScopeHandle::new(self.clone(), scope);
                let built = MutexGuard::unlocked(graph, || {
                    catch_unwind(AssertUnwindSafe(|| build(&key, &handle)))
                });
                let message = match built {
                    Ok(Ok(output)) => {
                        tracing::debug!(switch = %switch, scope = %scope, branch = %output, "branch built");
                        let slot = BranchSlot {
                            key,
                            output,
                            scope: Some(scope),
                        };
                        return graph.install_branch(switch, slot, activating);
                    }
                    Ok(Err(message)) => message,
                    Err(payload) => panic_message(payload),
                };
                graph.begin_close(scope);
                return Err(Error::Build {
                    node: switch,
                    message,
                });
            }
        };
        // A branch spliced in while the switch activates becomes current
        // right away; one spliced in during propagation waits for commit.
        graph.install_branch(switch, slot, activating)
    }

    fn notify_lifecycle(&self, transitions: &[LifecycleEvent]) {
        if transitions.is_empty() {
            return;
        }
        let Some(listener) = self.inner.listener.lock().clone() else {
            return;
        };
        for event in transitions {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::warn!(message = %panic_message(payload), "lifecycle listener panicked");
            }
        }
    }
}

/// Give `id` its initial value from the transaction view. A stream
/// activated mid-transaction fires if one of its upstreams did.
fn materialize_node(graph: &mut Graph, id: NodeId, staging: &mut Staging) -> std::result::Result<(), Interrupt> {
    let Some(node) = graph.nodes.get_node(id) else {
        graph.activating.shift_remove(&id);
        return Ok(());
    };
    let mut occurrence = None;
    let value = match &node.behavior {
        Behavior::Constant | Behavior::Input => None,
        Behavior::External { initial, .. } => initial.clone(),
        Behavior::Derived(derive) => {
            let slots = view_slots(&graph.nodes, node.dependencies(), staging);
            if node.is_state() {
                match run_derive(id, derive, &slots, None)? {
                    Some(value) => Some(value),
                    None => {
                        return Err(Interrupt::Fail(Error::Derivation {
                            node: id,
                            message: "no initial value".to_string(),
                        }))
                    }
                }
            } else {
                if slots.iter().any(|slot| slot.changed) {
                    occurrence = run_derive(id, derive, &slots, None)?;
                }
                None
            }
        }
        Behavior::Switch(state) => Some(switch_view(&graph.nodes, id, state, staging)?),
    };

    if let Some(node) = graph.nodes.get_node_mut(id) {
        if let Some(value) = value {
            node.set_value(value);
        }
        node.set_state(ActivationState::Active);
    }
    if let Some(value) = occurrence {
        staging.stage(id, value);
    }
    graph.activating.shift_remove(&id);
    graph.record(id, Transition::Activated);
    Ok(())
}

/// Re-derive an active node if one of its inputs changed in this pass.
fn rederive(graph: &Graph, id: NodeId, staging: &mut Staging) -> std::result::Result<(), Interrupt> {
    let Some(node) = graph.nodes.get_node(id) else {
        return Ok(());
    };
    let slots = view_slots(&graph.nodes, node.dependencies(), staging);
    if !slots.iter().any(|slot| slot.changed) {
        return Ok(());
    }
    let produced = match &node.behavior {
        Behavior::Derived(derive) => run_derive(id, derive, &slots, node.value())?,
        Behavior::Switch(state) => Some(switch_view(&graph.nodes, id, state, staging)?),
        _ => None,
    };
    if let Some(value) = produced {
        if !node.is_state() || node.differs(&value) {
            staging.stage(id, value);
        }
    }
    Ok(())
}

fn run_derive(id: NodeId, derive: &DeriveFn, slots: &[Slot], prev: Option<&Value>) -> Result<Option<Value>> {
    let inputs = Inputs::new(slots, prev);
    match catch_unwind(AssertUnwindSafe(|| derive(&inputs))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(Error::Derivation { node: id, message }),
        Err(payload) => Err(Error::Derivation {
            node: id,
            message: panic_message(payload),
        }),
    }
}

fn committed(nodes: &UpdateScheduler, id: NodeId) -> Option<Value> {
    nodes
        .get_node(id)
        .filter(|node| node.is_state())
        .and_then(|node| node.value().cloned())
}

/// A cell's value as of this transaction.
fn view(nodes: &UpdateScheduler, id: NodeId, staging: &Staging) -> Option<Value> {
    staging
        .values
        .get(&id)
        .cloned()
        .or_else(|| committed(nodes, id))
}

fn view_slots(nodes: &UpdateScheduler, upstream: &[NodeId], staging: &Staging) -> SmallVec<[Slot; 4]> {
    upstream
        .iter()
        .map(|dependency| match staging.values.get(dependency) {
            Some(value) => Slot {
                value: Some(Arc::clone(value)),
                changed: true,
            },
            None => Slot {
                value: committed(nodes, *dependency),
                changed: false,
            },
        })
        .collect()
}

fn switch_view(
    nodes: &UpdateScheduler,
    id: NodeId,
    state: &SwitchState,
    staging: &Staging,
) -> std::result::Result<Value, Interrupt> {
    let key = view(nodes, state.selector, staging).ok_or_else(|| Error::Derivation {
        node: id,
        message: "selector has no value".to_string(),
    })?;
    let Some(output) = state.output_for(&key) else {
        return Err(Interrupt::Splice { switch: id, key });
    };
    view(nodes, output, staging).ok_or_else(|| {
        Interrupt::Fail(Error::Derivation {
            node: id,
            message: "branch has no value".to_string(),
        })
    })
}

fn commit(graph: &mut Graph, staging: &Staging) {
    for id in &staging.order {
        let (Some(node), Some(value)) = (graph.nodes.get_node_mut(*id), staging.values.get(id)) else {
            continue;
        };
        if node.is_state() {
            node.set_value(Arc::clone(value));
        }
    }
    graph.promote_pending();
}

/// Changed nodes notify first, in the order they changed; observers still
/// waiting for their first delivery follow in registration order.
fn collect_deliveries(graph: &mut Graph, staging: &Staging) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    for id in &staging.order {
        let (Some(node), Some(value)) = (graph.nodes.get_node(*id), staging.values.get(id)) else {
            continue;
        };
        for observer in node.observers() {
            let Some(entry) = graph.observers.get_mut(observer) else {
                continue;
            };
            if entry.is_cancelled() || entry.status == ObserverStatus::Pending {
                continue;
            }
            entry.status = ObserverStatus::Attached { primed: true };
            deliveries.push(Delivery {
                callback: Arc::clone(&entry.callback),
                value: Arc::clone(value),
                cancelled: Arc::clone(&entry.cancelled),
            });
        }
    }

    for entry in graph.observers.values_mut() {
        if entry.is_cancelled() || entry.status != (ObserverStatus::Attached { primed: false }) {
            continue;
        }
        let Some(node) = graph.nodes.get_node(entry.node).filter(|node| node.is_active()) else {
            continue;
        };
        entry.status = ObserverStatus::Attached { primed: true };
        if let Some(value) = node.value().filter(|_| node.is_state()) {
            deliveries.push(Delivery {
                callback: Arc::clone(&entry.callback),
                value: Arc::clone(value),
                cancelled: Arc::clone(&entry.cancelled),
            });
        }
    }
    deliveries
}

/// Run callbacks with the lock released. Returns the first panic message.
fn deliver(deliveries: Vec<Delivery>) -> Option<String> {
    let mut panicked = None;
    for delivery in deliveries {
        if delivery.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        let callback = &delivery.callback;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&delivery.value))) {
            let message = panic_message(payload);
            tracing::warn!(%message, "observer callback panicked");
            panicked.get_or_insert(message);
        }
    }
    panicked
}

fn run_cleanup(teardowns: Vec<Subscription>, hooks: Vec<CloseHook>) {
    for subscription in teardowns {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscription.unsubscribe())) {
            tracing::warn!(message = %panic_message(payload), "subscription teardown panicked");
        }
    }
    for hook in hooks {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
            tracing::warn!(message = %panic_message(payload), "on_close hook panicked");
        }
    }
}
