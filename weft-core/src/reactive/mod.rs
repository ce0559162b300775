//! Reactive Primitives
//!
//! This module implements the typed surface of the network: value cells,
//! event streams, roots, observers, activation scopes and build
//! specifications. These handles are thin: each one is a node id plus the
//! network that owns the node, and every operation goes through that
//! network.
//!
//! # Concepts
//!
//! ## Value Cells
//!
//! A [`State<T>`] always has a current value while it is active. Cells are
//! constants, mutable roots ([`StateInput`]), external sources, or derived
//! from other nodes with `map` and `combine`. Setting a cell to a value
//! equal to its current one is not a change and does not propagate.
//!
//! ## Event Streams
//!
//! An [`Events<T>`] has no current value. It carries an occurrence only in
//! the transaction in which it fires.
//!
//! ## Observers and Scopes
//!
//! Nothing is computed until something is observed. `observe` registers an
//! epilogue callback; the observed node and everything upstream of it
//! become active at the next transaction boundary. Observers belong to the
//! ambient [`ScopeHandle`] and are cancelled when it closes.
//!
//! ## Build Specifications
//!
//! A [`BuildSpec<T>`] is a recipe that constructs nodes only when it runs
//! in a scope. Switch nodes run specs on demand so that the selected
//! subgraph is built, and the deselected one torn down, in one transaction.

pub(crate) mod context;
pub(crate) mod events;
pub(crate) mod input;
pub(crate) mod observer;
pub(crate) mod scope;
pub(crate) mod spec;
pub(crate) mod state;

pub use events::Events;
pub use input::{Emitter, EventInput, PendingWrite, StateInput, Subscription};
pub use observer::{ObserverHandle, ObserverId};
pub use scope::{ScopeHandle, ScopeId};
pub use spec::{select, Branch, BuildSpec};
pub use state::{combine_all, State};

/// Values that can flow through the network.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Values that can be held by a cell. Equality decides whether a new value
/// is a change.
pub trait CellData: Data + PartialEq {}

impl<T: Data + PartialEq> CellData for T {}
