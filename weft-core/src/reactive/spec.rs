//! Build Specifications and Switching
//!
//! A [`BuildSpec<T>`] wraps a builder closure. Deferring does no work;
//! running it in a scope makes that scope ambient for the builder, so every
//! node and observer the builder creates is owned by the scope and torn
//! down when it closes. Specs keep no result between runs: two runs build
//! two independent instances.
//!
//! Switch nodes are how specs change the topology. A switch reads a
//! selector cell and follows the output of the branch built for the
//! selector's current key. Branches are resolved in one of two ways:
//!
//! - `flatten` follows an inner cell held by the selector
//! - `switch_spec` and [`select`] run a spec in a fresh child scope
//!
//! The transaction engine installs a new branch as *pending* while it
//! settles, then promotes it at commit and retires the previous one in the
//! epilogue, so observers of the switch see one switchover.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{value_eq, Behavior, EqFn, Flavor, NodeId, Value};
use crate::network::Network;

use super::context::ReactiveContext;
use super::scope::{ScopeHandle, ScopeId};
use super::state::State;
use super::CellData;

/// A deferred recipe for a node or subgraph.
///
/// # Example
///
/// ```rust
/// use weft_core::{BuildSpec, Network, NetworkConfig};
///
/// let network = Network::new(NetworkConfig::default());
/// let counter = BuildSpec::defer(|scope| scope.network().state_input(0));
///
/// let scope = network.open_scope().unwrap();
/// let first = counter.run_in(&scope).unwrap();
/// let second = counter.run_in(&scope).unwrap();
///
/// first.set(3).unwrap();
/// assert_eq!(first.sample().unwrap(), 3);
/// assert_eq!(second.sample().unwrap(), 0);
/// ```
pub struct BuildSpec<T> {
    build: Arc<dyn Fn(&ScopeHandle) -> T + Send + Sync>,
}

impl<T: 'static> BuildSpec<T> {
    /// Wrap `build` without running it.
    pub fn defer<F>(build: F) -> Self
    where
        F: Fn(&ScopeHandle) -> T + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
        }
    }

    /// Run the builder with `scope` ambient.
    pub fn run_in(&self, scope: &ScopeHandle) -> Result<T> {
        if !scope.is_open() {
            return Err(Error::ScopeClosed(scope.id()));
        }
        Ok(scope.enter(|| (self.build)(scope)))
    }

    /// Run the builder in the scope that is ambient for `network`.
    pub fn run(&self, network: &Network) -> Result<T> {
        let id = ReactiveContext::current_scope(network.id()).ok_or(Error::NoAmbientScope)?;
        self.run_in(&ScopeHandle::new(network.clone(), id))
    }

    /// A spec that runs this one and transforms its result.
    pub fn map<U, F>(&self, f: F) -> BuildSpec<U>
    where
        U: 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let build = Arc::clone(&self.build);
        BuildSpec {
            build: Arc::new(move |scope| f(build(scope))),
        }
    }
}

impl<T> Clone for BuildSpec<T> {
    fn clone(&self) -> Self {
        Self {
            build: Arc::clone(&self.build),
        }
    }
}

impl<T> fmt::Debug for BuildSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSpec").finish_non_exhaustive()
    }
}

/// Which of the two specs handed to [`select`] is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Left,
    Right,
}

/// Switch between two specs on a boolean cell: `on_true` while the
/// selector holds `true`, `on_false` otherwise.
///
/// Only the selected spec is built. When the selector flips, the other spec
/// runs in a fresh scope and the previous instance is torn down in the same
/// transaction.
pub fn select<T: CellData>(
    selector: &State<bool>,
    on_true: BuildSpec<State<T>>,
    on_false: BuildSpec<State<T>>,
) -> State<T> {
    selector
        .map(|flag| if *flag { Branch::Left } else { Branch::Right })
        .switch_spec(move |branch| match branch {
            Branch::Left => on_true.clone(),
            Branch::Right => on_false.clone(),
        })
}

pub(crate) type BuildFn = dyn Fn(&Value, &ScopeHandle) -> std::result::Result<NodeId, String> + Send + Sync;

/// How a switch turns a selector key into a branch.
#[derive(Clone)]
pub(crate) enum Resolver {
    /// The key is itself a cell handle; follow it.
    Follow(fn(&Value) -> Option<NodeId>),

    /// Run the spec chosen for the key in a child scope.
    Build(Arc<BuildFn>),
}

/// A branch wired into a switch.
pub(crate) struct BranchSlot {
    pub(crate) key: Value,
    pub(crate) output: NodeId,

    /// The scope the branch was built in. Followed branches have none.
    pub(crate) scope: Option<ScopeId>,
}

pub(crate) struct SwitchState {
    pub(crate) selector: NodeId,
    pub(crate) resolver: Resolver,
    pub(crate) key_eq: EqFn,
    pub(crate) current: Option<BranchSlot>,
    pub(crate) pending: Option<BranchSlot>,
}

impl SwitchState {
    fn new(selector: NodeId, resolver: Resolver, key_eq: EqFn) -> Self {
        Self {
            selector,
            resolver,
            key_eq,
            current: None,
            pending: None,
        }
    }

    /// The output of the branch built for `key`, current branch first.
    pub(crate) fn output_for(&self, key: &Value) -> Option<NodeId> {
        [&self.current, &self.pending]
            .into_iter()
            .flatten()
            .find(|slot| (self.key_eq)(&slot.key, key))
            .map(|slot| slot.output)
    }
}

fn follow<T: 'static>(key: &Value) -> Option<NodeId> {
    key.downcast_ref::<State<T>>().map(State::id)
}

impl<T: CellData> State<State<T>> {
    /// Follow whichever cell this cell currently holds.
    pub fn flatten(&self) -> State<T> {
        let state = SwitchState::new(
            self.id(),
            Resolver::Follow(follow::<T>),
            value_eq::<State<T>>,
        );
        self.network().switch_node(state)
    }
}

impl<K: CellData> State<K> {
    /// Follow the cell built by the spec `choose` picks for the current
    /// key.
    ///
    /// Each time the key changes, `choose` runs for the new key and the
    /// spec it returns is run in a child scope of this switch's scope. The
    /// previous branch's scope is closed once the switchover commits.
    pub fn switch_spec<T, F>(&self, choose: F) -> State<T>
    where
        T: CellData,
        F: Fn(&K) -> BuildSpec<State<T>> + Send + Sync + 'static,
    {
        let build = move |key: &Value, scope: &ScopeHandle| {
            let key = key
                .downcast_ref::<K>()
                .ok_or_else(|| "selector holds a value of an unexpected type".to_string())?;
            choose(key)
                .run_in(scope)
                .map(|output| output.id())
                .map_err(|err| err.to_string())
        };
        let state = SwitchState::new(self.id(), Resolver::Build(Arc::new(build)), value_eq::<K>);
        self.network().switch_node(state)
    }
}

impl Network {
    fn switch_node<T: CellData>(&self, state: SwitchState) -> State<T> {
        let selector = state.selector;
        let id = self.add_node(
            Flavor::State,
            Behavior::Switch(state),
            Some(value_eq::<T>),
            None,
            &[selector],
        );
        State::from_id(self.clone(), id)
    }
}
