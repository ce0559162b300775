//! Event Streams
//!
//! [`Events<T>`] is a handle to a stream node. A stream fires at most once
//! per transaction; its occurrence lives in that transaction's staging area
//! only and is never stored on the node.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::{value_eq, Behavior, DeriveFn, Flavor, Inputs, NodeId, Value};
use crate::network::Network;

use super::observer::{erase, ObserverHandle};
use super::state::State;
use super::{CellData, Data};

/// A handle to an event stream.
pub struct Events<T> {
    network: Network,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Events<T> {
    pub(crate) fn from_id(network: Network, id: NodeId) -> Self {
        Self {
            network,
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl<T: Data> Events<T> {
    fn derive_events<U: Data>(&self, upstream: &[NodeId], derive: Box<DeriveFn>) -> Events<U> {
        let id = self.network.add_node(
            Flavor::Events,
            Behavior::Derived(derive),
            None,
            None,
            upstream,
        );
        Events::from_id(self.network.clone(), id)
    }

    fn derive_state<U: CellData>(&self, derive: Box<DeriveFn>) -> State<U> {
        let id = self.network.add_node(
            Flavor::State,
            Behavior::Derived(derive),
            Some(value_eq::<U>),
            None,
            &[self.id],
        );
        State::from_id(self.network.clone(), id)
    }

    /// Call `f` with every occurrence, after the transaction it fired in.
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

    pub fn map<U, F>(&self, f: F) -> Events<U>
    where
        U: Data,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.derive_events(
            &[self.id],
            Box::new(move |inputs: &Inputs<'_>| {
                Ok(inputs
                    .fired::<T>(0)
                    .map(|occurrence| Arc::new(f(occurrence)) as Value))
            }),
        )
    }

    pub fn filter<F>(&self, predicate: F) -> Events<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.derive_events(
            &[self.id],
            Box::new(move |inputs: &Inputs<'_>| {
                Ok(inputs
                    .fired::<T>(0)
                    .filter(|occurrence| predicate(occurrence))
                    .map(|occurrence| Arc::new(occurrence.clone()) as Value))
            }),
        )
    }

    pub fn filter_map<U, F>(&self, f: F) -> Events<U>
    where
        U: Data,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        self.derive_events(
            &[self.id],
            Box::new(move |inputs: &Inputs<'_>| {
                Ok(inputs
                    .fired::<T>(0)
                    .and_then(|occurrence| f(occurrence))
                    .map(|value| Arc::new(value) as Value))
            }),
        )
    }

    /// Fire whenever either stream fires. When both fire in one
    /// transaction, `resolve` combines the two occurrences.
    pub fn merge_with<F>(&self, other: &Events<T>, resolve: F) -> Events<T>
    where
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        self.derive_events(
            &[self.id, other.id],
            Box::new(move |inputs: &Inputs<'_>| {
                let merged = match (inputs.fired::<T>(0), inputs.fired::<T>(1)) {
                    (Some(left), Some(right)) => Some(resolve(left, right)),
                    (Some(only), None) | (None, Some(only)) => Some(only.clone()),
                    (None, None) => None,
                };
                Ok(merged.map(|value| Arc::new(value) as Value))
            }),
        )
    }

    /// Sample `cell` whenever this stream fires. The cell is read as of the
    /// same transaction.
    pub fn snapshot<B, U, F>(&self, cell: &State<B>, f: F) -> Events<U>
    where
        B: CellData,
        U: Data,
        F: Fn(&T, &B) -> U + Send + Sync + 'static,
    {
        self.derive_events(
            &[self.id, cell.id()],
            Box::new(move |inputs: &Inputs<'_>| match inputs.fired::<T>(0) {
                Some(occurrence) => {
                    let current = inputs.get::<B>(1)?;
                    Ok(Some(Arc::new(f(occurrence, current)) as Value))
                }
                None => Ok(None),
            }),
        )
    }

    /// A cell holding the latest occurrence, starting from `initial`.
    ///
    /// The cell starts over from `initial` every time it activates.
    pub fn hold(&self, initial: T) -> State<T>
    where
        T: PartialEq,
    {
        let initial: Value = Arc::new(initial);
        self.derive_state(Box::new(move |inputs: &Inputs<'_>| {
            if let Some(occurrence) = inputs.fired::<T>(0) {
                return Ok(Some(Arc::new(occurrence.clone()) as Value));
            }
            if inputs.prev::<T>().is_none() {
                return Ok(Some(Arc::clone(&initial)));
            }
            Ok(None)
        }))
    }

    /// A cell accumulating occurrences with `f`, starting from `seed`.
    ///
    /// The accumulator starts over from `seed` every time it activates.
    pub fn fold<A, F>(&self, seed: A, f: F) -> State<A>
    where
        A: CellData,
        F: Fn(&A, &T) -> A + Send + Sync + 'static,
    {
        self.derive_state(Box::new(move |inputs: &Inputs<'_>| {
            let current = inputs.prev::<A>();
            match inputs.fired::<T>(0) {
                Some(occurrence) => {
                    let next = f(current.unwrap_or(&seed), occurrence);
                    Ok(Some(Arc::new(next) as Value))
                }
                None if current.is_none() => Ok(Some(Arc::new(seed.clone()) as Value)),
                None => Ok(None),
            }
        }))
    }
}

impl Network {
    /// A stream that never fires.
    pub fn never<T: Data>(&self) -> Events<T> {
        let id = self.add_node(Flavor::Events, Behavior::Constant, None, None, &[]);
        Events::from_id(self.clone(), id)
    }
}

impl<T> Clone for Events<T> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Events<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> fmt::Debug for Events<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").field("id", &self.id).finish()
    }
}
