//! Reactive Context
//!
//! The reactive context tracks what the current thread is doing on behalf
//! of each network: which scope is ambient (nodes and observers created now
//! are owned by it) and whether a propagation pass is running.
//!
//! # Implementation
//!
//! We use a thread-local stack. Running a build specification or entering
//! a scope pushes a scope entry; the transaction engine pushes a phase
//! entry around every derivation pass. Lookups walk the stack from the top
//! and only consider entries for the network asking, so networks never see
//! each other's context.
//!
//! This design supports nesting (a build specification that runs another
//! build specification in a child scope).

use std::cell::RefCell;

use super::scope::ScopeId;
use crate::network::NetworkId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// What a context entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// Nodes constructed while this entry is on top belong to the scope.
    Scope(ScopeId),

    /// Derivation functions are running under the graph lock.
    Propagating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextEntry {
    network: NetworkId,
    frame: Frame,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if the
/// builder or derivation panics.
pub(crate) struct ReactiveContext {
    entry: ContextEntry,
}

impl ReactiveContext {
    /// Make `scope` the ambient scope for `network` until the guard drops.
    pub(crate) fn enter_scope(network: NetworkId, scope: ScopeId) -> Self {
        Self::push(ContextEntry {
            network,
            frame: Frame::Scope(scope),
        })
    }

    /// Mark `network` as propagating until the guard drops.
    pub(crate) fn enter_propagation(network: NetworkId) -> Self {
        Self::push(ContextEntry {
            network,
            frame: Frame::Propagating,
        })
    }

    fn push(entry: ContextEntry) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(entry));
        Self { entry }
    }

    /// The innermost ambient scope for `network`, if any.
    pub(crate) fn current_scope(network: NetworkId) -> Option<ScopeId> {
        CONTEXT_STACK.with(|stack| {
            stack.borrow().iter().rev().find_map(|entry| match entry.frame {
                Frame::Scope(scope) if entry.network == network => Some(scope),
                _ => None,
            })
        })
    }

    /// Whether this thread is inside a propagation pass of `network`.
    ///
    /// A scope entered on top of a pass (a switch running a build
    /// specification) ends the propagation frame for its duration.
    pub(crate) fn is_propagating(network: NetworkId) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|entry| entry.network == network)
                .map(|entry| entry.frame == Frame::Propagating)
                .unwrap_or(false)
        })
    }

    /// Check if this thread has any context for `network`.
    #[cfg(test)]
    pub(crate) fn is_active(network: NetworkId) -> bool {
        CONTEXT_STACK.with(|stack| stack.borrow().iter().any(|entry| entry.network == network))
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Guards are strictly nested.
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry, self.entry,
                    "context entries popped out of order: expected {:?}, got {:?}",
                    self.entry, entry
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_scope() {
        let network = NetworkId::new();
        let scope = ScopeId::new();

        assert!(!ReactiveContext::is_active(network));
        assert!(ReactiveContext::current_scope(network).is_none());

        {
            let _ctx = ReactiveContext::enter_scope(network, scope);

            assert!(ReactiveContext::is_active(network));
            assert_eq!(ReactiveContext::current_scope(network), Some(scope));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_active(network));
        assert!(ReactiveContext::current_scope(network).is_none());
    }

    #[test]
    fn nested_scopes() {
        let network = NetworkId::new();
        let outer = ScopeId::new();
        let inner = ScopeId::new();

        {
            let _ctx1 = ReactiveContext::enter_scope(network, outer);
            assert_eq!(ReactiveContext::current_scope(network), Some(outer));

            {
                let _ctx2 = ReactiveContext::enter_scope(network, inner);
                assert_eq!(ReactiveContext::current_scope(network), Some(inner));
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_scope(network), Some(outer));
        }

        assert!(ReactiveContext::current_scope(network).is_none());
    }

    #[test]
    fn networks_do_not_share_context() {
        let first = NetworkId::new();
        let second = NetworkId::new();
        let scope = ScopeId::new();

        let _scope = ReactiveContext::enter_scope(first, scope);
        let _pass = ReactiveContext::enter_propagation(second);

        assert_eq!(ReactiveContext::current_scope(first), Some(scope));
        assert!(ReactiveContext::current_scope(second).is_none());
        assert!(ReactiveContext::is_propagating(second));
        assert!(!ReactiveContext::is_propagating(first));
    }

    #[test]
    fn scope_entered_during_propagation_suspends_it() {
        let network = NetworkId::new();
        let scope = ScopeId::new();

        let _pass = ReactiveContext::enter_propagation(network);
        assert!(ReactiveContext::is_propagating(network));

        {
            let _build = ReactiveContext::enter_scope(network, scope);
            assert!(!ReactiveContext::is_propagating(network));
        }

        assert!(ReactiveContext::is_propagating(network));
    }
}
