//! Value Cells
//!
//! [`State<T>`] is a handle to a cell node. Derived cells recompute only
//! when an upstream changed in the transaction that reaches them, and see
//! the settled values of all their inputs for that transaction.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use weft_core::{Network, NetworkConfig};
//!
//! let network = Network::new(NetworkConfig::default());
//! let a = network.state_input(1);
//! let b = network.state_input(10);
//! let sum = a.state().combine(b.state(), |x, y| x + y);
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _observer = sum.observe(move |v| sink.lock().unwrap().push(*v));
//!
//! network
//!     .transaction(|tx| {
//!         tx.set(&a, 2);
//!         tx.set(&b, 20);
//!     })
//!     .unwrap();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![11, 22]);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{value_eq, ActivationState, Behavior, DeriveFn, Flavor, Inputs, NodeId, Value};
use crate::network::Network;

use super::events::Events;
use super::observer::{erase, ObserverHandle};
use super::{CellData, Data};

/// A handle to a value cell.
///
/// Handles are cheap to clone. Two handles are equal when they refer to
/// the same node.
pub struct State<T> {
    network: Network,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> State<T> {
    pub(crate) fn from_id(network: Network, id: NodeId) -> Self {
        Self {
            network,
            id,
            _marker: PhantomData,
        }
    }

    /// The node behind this handle.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The network that owns this cell.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Current activation state, or `None` once the node is gone.
    pub fn activation_state(&self) -> Option<ActivationState> {
        self.network.activation_state(self.id)
    }
}

fn derived<U: CellData>(
    network: &Network,
    upstream: &[NodeId],
    derive: Box<DeriveFn>,
) -> State<U> {
    let id = network.add_node(
        Flavor::State,
        Behavior::Derived(derive),
        Some(value_eq::<U>),
        None,
        upstream,
    );
    State::from_id(network.clone(), id)
}

fn boxed<T: Data>(value: T) -> Option<Value> {
    Some(Arc::new(value))
}

impl<T: CellData> State<T> {
    /// Read the settled value.
    ///
    /// Constants and root inputs always have a value. Every other cell
    /// must be active; sampling it otherwise reports [`Error::Inactive`].
    pub fn sample(&self) -> Result<T> {
        let value = self.network.sample_value(self.id)?;
        value.downcast_ref::<T>().cloned().ok_or(Error::Disposed(self.id))
    }

    /// Call `f` with the initial value once this cell activates, then with
    /// every new value after the transaction that produced it.
    pub fn observe<F>(&self, f: F) -> ObserverHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.network.register_observer(self.id, erase(f))
    }

    /// Like [`observe`](Self::observe), but reports the error if the
    /// attach fails, for instance because a derivation upstream cannot
    /// produce an initial value. In manual mode the attach is only applied
    /// by the next drain, so this returns `Ok`.
    pub fn try_observe<F>(&self, f: F) -> Result<ObserverHandle>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.network.try_register_observer(self.id, erase(f))
    }

    pub fn map<U, F>(&self, f: F) -> State<U>
    where
        U: CellData,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        derived(
            &self.network,
            &[self.id],
            Box::new(move |inputs: &Inputs<'_>| Ok(boxed(f(inputs.get::<T>(0)?)))),
        )
    }

    /// Like [`map`](Self::map), but `f` may fail. A failure aborts the
    /// transaction with [`Error::Derivation`]. If it happens while the cell
    /// activates, the observers that activated it are cancelled instead.
    pub fn try_map<U, E, F>(&self, f: F) -> State<U>
    where
        U: CellData,
        E: fmt::Display,
        F: Fn(&T) -> std::result::Result<U, E> + Send + Sync + 'static,
    {
        derived(
            &self.network,
            &[self.id],
            Box::new(move |inputs: &Inputs<'_>| {
                f(inputs.get::<T>(0)?)
                    .map(boxed)
                    .map_err(|err| err.to_string())
            }),
        )
    }

    pub fn combine<B, U, F>(&self, other: &State<B>, f: F) -> State<U>
    where
        B: CellData,
        U: CellData,
        F: Fn(&T, &B) -> U + Send + Sync + 'static,
    {
        derived(
            &self.network,
            &[self.id, other.id],
            Box::new(move |inputs: &Inputs<'_>| {
                Ok(boxed(f(inputs.get::<T>(0)?, inputs.get::<B>(1)?)))
            }),
        )
    }

    pub fn combine3<B, C, U, F>(&self, second: &State<B>, third: &State<C>, f: F) -> State<U>
    where
        B: CellData,
        C: CellData,
        U: CellData,
        F: Fn(&T, &B, &C) -> U + Send + Sync + 'static,
    {
        derived(
            &self.network,
            &[self.id, second.id, third.id],
            Box::new(move |inputs: &Inputs<'_>| {
                Ok(boxed(f(
                    inputs.get::<T>(0)?,
                    inputs.get::<B>(1)?,
                    inputs.get::<C>(2)?,
                )))
            }),
        )
    }

    /// A stream that fires the new value whenever this cell changes. It
    /// does not fire for the value the cell activates with.
    pub fn changes(&self) -> Events<T> {
        let derive: Box<DeriveFn> = Box::new(|inputs: &Inputs<'_>| {
            if !inputs.changed(0) {
                return Ok(None);
            }
            Ok(boxed(inputs.get::<T>(0)?.clone()))
        });
        let id = self.network.add_node(
            Flavor::Events,
            Behavior::Derived(derive),
            None,
            None,
            &[self.id],
        );
        Events::from_id(self.network.clone(), id)
    }
}

/// Combine any number of cells of one type.
pub fn combine_all<T, U, F>(network: &Network, cells: &[State<T>], f: F) -> State<U>
where
    T: CellData,
    U: CellData,
    F: Fn(&[T]) -> U + Send + Sync + 'static,
{
    let upstream: Vec<NodeId> = cells.iter().map(State::id).collect();
    derived(
        network,
        &upstream,
        Box::new(move |inputs: &Inputs<'_>| {
            let values = (0..inputs.len())
                .map(|index| inputs.get::<T>(index).cloned())
                .collect::<std::result::Result<Vec<T>, String>>()?;
            Ok(boxed(f(&values)))
        }),
    )
}

impl Network {
    /// A cell that never changes.
    pub fn constant<T: CellData>(&self, value: T) -> State<T> {
        let id = self.add_node(
            Flavor::State,
            Behavior::Constant,
            Some(value_eq::<T>),
            Some(Arc::new(value)),
            &[],
        );
        State::from_id(self.clone(), id)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for State<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for State<T> {}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkConfig;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn constants_are_always_available() {
        let network = Network::new(NetworkConfig::default());
        let answer = network.constant(42);

        assert_eq!(answer.sample().unwrap(), 42);
        assert_eq!(answer.activation_state(), Some(ActivationState::Inactive));
    }

    #[test]
    fn derived_cell_is_inactive_until_observed() {
        let network = Network::new(NetworkConfig::default());
        let input = network.state_input(2);
        let doubled = input.state().map(|v| v * 2);

        assert!(matches!(
            doubled.sample(),
            Err(Error::Inactive { state: ActivationState::Inactive, .. })
        ));

        let _observer = doubled.observe(|_| {});
        assert_eq!(doubled.sample().unwrap(), 4);
    }

    #[test]
    fn map_skips_equal_values() {
        let network = Network::new(NetworkConfig::default());
        let input = network.state_input(1);
        let parity = input.state().map(|v| v % 2);

        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let _observer = parity.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        input.set(3).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        input.set(4).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_map_failure_keeps_last_value() {
        let network = Network::new(NetworkConfig::default());
        let input = network.state_input(4);
        let halved = input.state().try_map(|v| {
            if v % 2 == 0 {
                Ok(v / 2)
            } else {
                Err(format!("{v} is odd"))
            }
        });
        let _observer = halved.observe(|_| {});
        assert_eq!(halved.sample().unwrap(), 2);

        let err = input.set(5).unwrap_err();
        assert!(matches!(err, Error::Derivation { node, .. } if node == halved.id()));
        assert_eq!(halved.sample().unwrap(), 2);
        assert_eq!(input.sample().unwrap(), 4);
    }

    #[test]
    fn changes_fires_only_on_change() {
        let network = Network::new(NetworkConfig::default());
        let input = network.state_input(0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _observer = input
            .state()
            .changes()
            .observe(move |v| seen_clone.lock().unwrap().push(*v));

        input.set(0).unwrap();
        input.set(7).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn combine_all_reads_every_cell() {
        let network = Network::new(NetworkConfig::default());
        let inputs: Vec<_> = (1..=4).map(|v| network.state_input(v)).collect();
        let cells: Vec<_> = inputs.iter().map(|input| input.state().clone()).collect();
        let total = combine_all(&network, &cells, |values| values.iter().sum::<i32>());

        let _observer = total.observe(|_| {});
        assert_eq!(total.sample().unwrap(), 10);

        inputs[2].set(30).unwrap();
        assert_eq!(total.sample().unwrap(), 37);
    }

    #[test]
    fn combining_a_cell_with_itself() {
        let network = Network::new(NetworkConfig::default());
        let input = network.state_input(3);
        let square = input.state().combine(input.state(), |a, b| a * b);

        let _observer = square.observe(|_| {});
        input.set(5).unwrap();
        assert_eq!(square.sample().unwrap(), 25);
    }

    #[test]
    fn handles_compare_by_node() {
        let network = Network::new(NetworkConfig::default());
        let a = network.constant(1);
        let b = network.constant(1);

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
