//! Update Scheduler
//!
//! The scheduler owns the node arena and decides evaluation order. A node
//! is never evaluated before the nodes it reads.
//!
//! # Algorithm
//!
//! Ordering is a topological sort over a subset of the arena:
//!
//! 1. A transaction's written roots seed a breadth-first walk over
//!    dependent edges that stops at nodes which are not `Active`
//! 2. The visited set is sorted with Kahn's algorithm; only edges whose
//!    both ends are in the set contribute to a node's in-degree
//! 3. The transaction engine walks the sorted list and re-derives a node
//!    only if one of its inputs actually changed
//!
//! A diamond join has an in-degree of two, so it is released only after
//! both branches have been processed and runs once.
//!
//! Activation reuses the sort, with the set of nodes still waiting for an
//! initial value.

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::{ActivationState, Node, NodeId};

/// Arena of nodes plus the ordering queries the engine needs.
pub(crate) struct UpdateScheduler {
    nodes: HashMap<NodeId, Node>,
}

impl UpdateScheduler {
    pub(crate) fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub(crate) fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Take `id` out of the arena.
    ///
    /// Its upstreams forget it as a dependent. Dependents keep the dangling
    /// id in their read order so that activating them later reports the
    /// disposed dependency.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let removed = self.nodes.remove(&id)?;
        for upstream in removed.dependencies() {
            if let Some(node) = self.nodes.get_mut(upstream) {
                node.remove_dependent(id);
            }
        }
        Some(removed)
    }

    pub(crate) fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Record that `reader` reads `upstream`. Reading the same node twice
    /// adds a second read but a single dependent entry.
    pub(crate) fn add_edge(&mut self, upstream: NodeId, reader: NodeId) {
        if let Some(node) = self.nodes.get_mut(&upstream) {
            node.add_dependent(reader);
        }
        if let Some(node) = self.nodes.get_mut(&reader) {
            node.add_dependency(upstream);
        }
    }

    /// Drop one read of `upstream` by `reader`. The dependent entry goes
    /// away with the last read.
    pub(crate) fn remove_edge(&mut self, upstream: NodeId, reader: NodeId) {
        let reads_remaining = self.nodes.get_mut(&reader).is_some_and(|node| {
            node.remove_dependency(upstream);
            node.depends_on(upstream)
        });
        if reads_remaining {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&upstream) {
            node.remove_dependent(reader);
        }
    }

    /// Active nodes downstream of `roots`, dependencies first. The roots
    /// themselves are not included.
    pub(crate) fn affected(&self, roots: &[NodeId]) -> Result<Vec<NodeId>, NodeId> {
        let mut frontier: VecDeque<NodeId> = roots
            .iter()
            .filter_map(|root| self.nodes.get(root))
            .flat_map(|root| root.dependents().iter().copied())
            .collect();
        let mut seen = HashSet::new();
        let mut reached = Vec::new();

        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            // Inactive nodes hold no value and are not walked through.
            if node.state() == ActivationState::Active {
                reached.push(id);
                frontier.extend(node.dependents().iter().copied());
            }
        }

        self.topological_sort(reached)
    }

    /// Order `subset` so that every node follows the nodes it reads.
    ///
    /// On a cycle, returns the smallest id that could not be released.
    pub(crate) fn topological_sort(&self, subset: Vec<NodeId>) -> Result<Vec<NodeId>, NodeId> {
        let members: HashSet<NodeId> = subset.iter().copied().collect();
        let mut pending: HashMap<NodeId, usize> = HashMap::with_capacity(subset.len());
        let mut ready = VecDeque::new();

        for &id in &subset {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            // Repeated reads of one upstream count once.
            let inside: HashSet<&NodeId> = node
                .dependencies()
                .iter()
                .filter(|upstream| members.contains(*upstream))
                .collect();
            if inside.is_empty() {
                ready.push_back(id);
            }
            pending.insert(id, inside.len());
        }

        let mut order = Vec::with_capacity(pending.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for reader in node.dependents() {
                if let Some(count) = pending.get_mut(reader) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push_back(*reader);
                    }
                }
            }
        }

        if order.len() == pending.len() {
            return Ok(order);
        }
        let blocked = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id)
            .min();
        match blocked {
            Some(id) => Err(id),
            None => Ok(order),
        }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Drop every node. Used when the network shuts down.
    pub(crate) fn clear(&mut self) -> Vec<Node> {
        self.nodes.drain().map(|(_, node)| node).collect()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::tests::{derived, input};
    use crate::reactive::ScopeId;

    fn activate_all(scheduler: &mut UpdateScheduler, ids: &[NodeId]) {
        for id in ids {
            scheduler
                .get_node_mut(*id)
                .unwrap()
                .set_state(ActivationState::Active);
        }
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let id1 = scheduler.add_node(input(scope, 0));
        let id2 = scheduler.add_node(derived(scope));

        assert_eq!(scheduler.node_count(), 2);

        scheduler.remove_node(id1);
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
    }

    #[test]
    fn add_and_remove_edges() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let source_id = scheduler.add_node(input(scope, 0));
        let derived_id = scheduler.add_node(derived(scope));

        scheduler.add_edge(source_id, derived_id);

        // Check the edge exists
        assert!(scheduler
            .get_node(source_id)
            .unwrap()
            .dependents()
            .contains(&derived_id));
        assert!(scheduler
            .get_node(derived_id)
            .unwrap()
            .dependencies()
            .contains(&source_id));

        // Remove the edge
        scheduler.remove_edge(source_id, derived_id);

        assert!(!scheduler
            .get_node(source_id)
            .unwrap()
            .dependents()
            .contains(&derived_id));
        assert!(!scheduler
            .get_node(derived_id)
            .unwrap()
            .dependencies()
            .contains(&source_id));
    }

    #[test]
    fn removing_a_node_keeps_dangling_dependency() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let source_id = scheduler.add_node(input(scope, 0));
        let derived_id = scheduler.add_node(derived(scope));
        scheduler.add_edge(source_id, derived_id);

        scheduler.remove_node(source_id);
        assert!(!scheduler.contains(source_id));
        assert_eq!(
            scheduler.get_node(derived_id).unwrap().dependencies(),
            &[source_id]
        );
    }

    #[test]
    fn repeated_reads_need_repeated_removal() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let source_id = scheduler.add_node(input(scope, 0));
        let derived_id = scheduler.add_node(derived(scope));
        scheduler.add_edge(source_id, derived_id);
        scheduler.add_edge(source_id, derived_id);
        activate_all(&mut scheduler, &[source_id, derived_id]);

        // Both reads are in the set, and the node is still sorted once.
        assert_eq!(scheduler.affected(&[source_id]).unwrap(), vec![derived_id]);

        scheduler.remove_edge(source_id, derived_id);
        assert!(scheduler
            .get_node(source_id)
            .unwrap()
            .dependents()
            .contains(&derived_id));

        scheduler.remove_edge(source_id, derived_id);
        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
    }

    #[test]
    fn affected_follows_active_chain_in_order() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        // Create a chain: source -> derived1 -> derived2
        let source_id = scheduler.add_node(input(scope, 0));
        let derived1_id = scheduler.add_node(derived(scope));
        let derived2_id = scheduler.add_node(derived(scope));

        scheduler.add_edge(source_id, derived1_id);
        scheduler.add_edge(derived1_id, derived2_id);
        activate_all(&mut scheduler, &[source_id, derived1_id, derived2_id]);

        let to_process = scheduler.affected(&[source_id]).unwrap();

        // Both derived nodes should be marked, dependencies first
        assert_eq!(to_process, vec![derived1_id, derived2_id]);
    }

    #[test]
    fn affected_skips_inactive_nodes() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let source_id = scheduler.add_node(input(scope, 0));
        let hot = scheduler.add_node(derived(scope));
        let cold = scheduler.add_node(derived(scope));
        scheduler.add_edge(source_id, hot);
        scheduler.add_edge(source_id, cold);
        activate_all(&mut scheduler, &[source_id, hot]);

        assert_eq!(scheduler.affected(&[source_id]).unwrap(), vec![hot]);
    }

    #[test]
    fn diamond_sorts_join_last() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let a = scheduler.add_node(input(scope, 0));
        let b = scheduler.add_node(derived(scope));
        let c = scheduler.add_node(derived(scope));
        let d = scheduler.add_node(derived(scope));
        scheduler.add_edge(a, b);
        scheduler.add_edge(a, c);
        scheduler.add_edge(b, d);
        scheduler.add_edge(c, d);
        activate_all(&mut scheduler, &[a, b, c, d]);

        let order = scheduler.affected(&[a]).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&d));
    }

    #[test]
    fn cycles_are_reported() {
        let mut scheduler = UpdateScheduler::new();
        let scope = ScopeId::new();

        let a = scheduler.add_node(derived(scope));
        let b = scheduler.add_node(derived(scope));
        scheduler.add_edge(a, b);
        scheduler.add_edge(b, a);

        let err = scheduler.topological_sort(vec![a, b]).unwrap_err();
        assert!(err == a || err == b);
    }
}
