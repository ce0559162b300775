//! Weft Core
//!
//! This crate provides the runtime for Weft, a push-based reactive
//! dataflow network. It implements:
//!
//! - Value cells and event streams with glitch-free propagation
//! - Transactions that commit all of their writes or none of them
//! - Lifetime-driven activation: nothing computes until it is observed
//! - Activation scopes and build specifications for dynamic topology
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Nodes and the dependency graph
//! - `reactive`: Typed handles (cells, streams, roots, observers, scopes)
//! - `network`: The queue, transaction engine and lifetime management
//! - `config`: Network configuration
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use weft_core::{Network, NetworkConfig};
//!
//! let network = Network::new(NetworkConfig::default());
//! let x = network.state_input(0);
//! let y = x.state().map(|v| v * 2);
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let scope = network.open_scope().unwrap();
//! scope.enter(|| y.observe(move |v| sink.lock().unwrap().push(*v)));
//!
//! x.set(5).unwrap();
//! scope.close().unwrap();
//! x.set(99).unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![0, 10]);
//!
//! let sink = Arc::clone(&seen);
//! let _observer = y.observe(move |v| sink.lock().unwrap().push(*v));
//! assert_eq!(*seen.lock().unwrap(), vec![0, 10, 198]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod network;
pub mod reactive;

pub use config::{DrainMode, NetworkConfig};
pub use error::{Error, Result};
pub use graph::{ActivationState, Flavor, NodeId, NodeKind};
pub use network::{Batch, LifecycleEvent, Network, NetworkId, Transition};
pub use reactive::{
    combine_all, select, Branch, BuildSpec, CellData, Data, Emitter, EventInput, Events,
    ObserverHandle, ObserverId, PendingWrite, ScopeHandle, ScopeId, State, StateInput,
    Subscription,
};
