//! Dependency Graph
//!
//! Every cell and stream of a network is a node in one arena, and an edge
//! records that one node reads another.
//!
//! # Overview
//!
//! The graph is acyclic:
//!
//! - A node is either a cell (it holds a current value while active) or a
//!   stream (it holds an occurrence only during the transaction it fires in)
//! - An edge from B to A means A reads B, so a change to B may change A
//!
//! A transaction's writes select the active nodes downstream of the written
//! roots. These are ordered topologically, and the engine re-derives only
//! the nodes whose inputs actually changed.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a central arena and refer to each other by id:
//!    - A dependency never owns its dependents
//!    - Ordering and cycle detection see the whole graph at once
//!    - Activation is a per-node count with no `Rc` cycles to break
//!
//! 2. Lookups go through a hash map keyed by node id.
//!
//! 3. Each node stores both its upstream reads and its dependents, so the
//!    engine can walk either direction. Dependents keep insertion order,
//!    which makes propagation order deterministic.

mod node;
mod scheduler;

pub use node::{ActivationState, Flavor, NodeId, NodeKind};

pub(crate) use node::{value_eq, Behavior, DeriveFn, EqFn, Inputs, Node, Slot, Value};
pub(crate) use scheduler::UpdateScheduler;
