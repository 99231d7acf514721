//! Traversal primitives.
//!
//! Each traversal instantiates one task per visited node and returns after
//! submission; the caller's phase barrier (`TaskPool::drain`) is what waits
//! for completion. Ordering between tasks comes entirely from the declared
//! read/write intents: an upward traversal's parent task reads what its
//! children's tasks wrote, so submitting deepest-level-first yields the
//! leaves-first schedule without any explicit level barrier.
//!
//! Scheduling policy is decoupled from per-phase logic: a traversal takes a
//! dependency builder (one of [`deps`]) and a visitor, so the same visitor
//! can run under different dependency shapes.
//!
//! The distributed traversals walk the single-child chain of distributed
//! nodes exactly once per level. Sibling proxies are never visited; they
//! exist purely as data carriers.

use super::build::Tree;
use super::{NodeHandle, NodeKind};
use crate::runtime::{Access, Priority, ResourceId, TaskPool};
use std::sync::Arc;

/// Builds the declared accesses of one task from the node it visits.
pub type DepsFn = fn(&Tree, NodeHandle) -> Vec<(ResourceId, Access)>;

/// The work of one task.
pub type VisitFn = Arc<dyn Fn(NodeHandle) + Send + Sync>;

/// Canonical dependency shapes.
pub mod deps {
    use super::*;

    fn children_of(tree: &Tree, handle: NodeHandle) -> Vec<NodeHandle> {
        match tree.registry.get(handle).kind {
            NodeKind::Distributed { child, .. } => vec![child],
            NodeKind::Local {
                children: Some(children),
            } => children.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Split shape: read the node, write its children.
    pub fn read_self_write_children(tree: &Tree, handle: NodeHandle) -> Vec<(ResourceId, Access)> {
        let mut accesses = vec![(handle.resource(), Access::Read)];
        for child in children_of(tree, handle) {
            accesses.push((child.resource(), Access::Write));
        }
        accesses
    }

    /// Upward shape: children's outputs feed the node.
    pub fn write_self_read_children(tree: &Tree, handle: NodeHandle) -> Vec<(ResourceId, Access)> {
        let mut accesses = vec![(handle.resource(), Access::Write)];
        for child in children_of(tree, handle) {
            accesses.push((child.resource(), Access::Read));
        }
        accesses
    }

    /// Merge shape: the node and its children are all mutated (children
    /// hand state up and are pruned in the process).
    pub fn write_self_write_children(tree: &Tree, handle: NodeHandle) -> Vec<(ResourceId, Access)> {
        let mut accesses = vec![(handle.resource(), Access::Write)];
        for child in children_of(tree, handle) {
            accesses.push((child.resource(), Access::Write));
        }
        accesses
    }

    /// Downward shape: the parent's outputs feed the node.
    pub fn write_self_read_parent(tree: &Tree, handle: NodeHandle) -> Vec<(ResourceId, Access)> {
        let mut accesses = vec![(handle.resource(), Access::Write)];
        if let Some(parent) = parent_of(tree, handle) {
            accesses.push((parent.resource(), Access::Read));
        }
        accesses
    }

    /// Independent shape: the node only.
    pub fn write_self(_tree: &Tree, handle: NodeHandle) -> Vec<(ResourceId, Access)> {
        vec![(handle.resource(), Access::Write)]
    }

    fn parent_of(tree: &Tree, handle: NodeHandle) -> Option<NodeHandle> {
        // The local subtree stores parent links implicitly through slots;
        // walk the level-order list. Chain nodes link explicitly.
        if let Some(slot) = tree.local_nodes.iter().position(|&h| h == handle) {
            if slot == 0 {
                return tree.chain.len().checked_sub(2).map(|i| tree.chain[i]);
            }
            return Some(tree.local_nodes[(slot - 1) / 2]);
        }
        tree.chain
            .iter()
            .position(|&h| h == handle)
            .and_then(|i| i.checked_sub(1))
            .map(|i| tree.chain[i])
    }
}

impl Tree {
    fn submit(
        &self,
        pool: &mut TaskPool,
        handle: NodeHandle,
        deps: DepsFn,
        priority: Priority,
        visit: &VisitFn,
    ) {
        let accesses = deps(self, handle);
        let visit = visit.clone();
        pool.submit(&accesses, priority, Box::new(move || (*visit)(handle)));
    }

    /// Local subtree, deepest level first, one level at a time. The local
    /// root is excluded: it belongs to the distributed traversals.
    pub fn traverse_local_up(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        for level in (1..=self.local_depth).rev() {
            for &handle in self.local_level(level) {
                self.submit(pool, handle, deps, priority, &visit);
            }
        }
    }

    /// Local subtree, root's children first, one level at a time.
    pub fn traverse_local_down(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        for level in 1..=self.local_depth {
            for &handle in self.local_level(level) {
                self.submit(pool, handle, deps, priority, &visit);
            }
        }
    }

    /// Leaf-level nodes only, mutually independent.
    pub fn traverse_local_leaves(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        for &handle in self.leaves() {
            self.submit(pool, handle, deps, priority, &visit);
        }
    }

    /// Order-free traversal: only the parent/child dependency matters, so
    /// this is the downward traversal.
    pub fn traverse_local_unordered(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        self.traverse_local_down(pool, deps, priority, visit)
    }

    /// Distributed chain from the local root up to the global root.
    pub fn traverse_dist_up(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        for &handle in self.chain.iter().rev() {
            self.submit(pool, handle, deps, priority, &visit);
        }
    }

    /// Distributed chain from the global root down to the local root.
    pub fn traverse_dist_down(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        for &handle in self.chain.iter() {
            self.submit(pool, handle, deps, priority, &visit);
        }
    }

    /// Order-free distributed traversal, implemented as downward.
    pub fn traverse_dist_unordered(
        &self,
        pool: &mut TaskPool,
        deps: DepsFn,
        priority: Priority,
        visit: VisitFn,
    ) {
        self.traverse_dist_down(pool, deps, priority, visit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ProcessGroup;
    use crate::kernel::{GaussianKernel, PointSet};
    use h2mat_types::{CompressionConfig, Topology};
    use std::sync::Mutex;

    fn solo_tree(n: usize, leaf: usize) -> Tree {
        let comm = ProcessGroup::new(1).pop().unwrap();
        let points = PointSet::new(1, (0..n).map(|i| i as f64).collect());
        let operator = Arc::new(GaussianKernel::new(points, 4.0));
        Tree::new(
            CompressionConfig::new(n, leaf),
            Topology::new(1, 2).unwrap(),
            comm,
            operator,
        )
        .unwrap()
    }

    #[test]
    fn upward_traversal_completes_children_before_parents() {
        let tree = solo_tree(64, 8);
        let mut pool = TaskPool::start("traverse-test", 3);
        let order = Arc::new(Mutex::new(Vec::new()));

        let visit: VisitFn = {
            let order = order.clone();
            Arc::new(move |handle| order.lock().unwrap().push(handle))
        };
        tree.traverse_local_up(&mut pool, deps::write_self_read_children, Priority::Normal, visit);
        pool.drain().unwrap();

        let order = order.lock().unwrap();
        // Levels 1..=3 of a depth-3 tree, every node once.
        assert_eq!(order.len(), 14);
        let position = |h: NodeHandle| order.iter().position(|&x| x == h).unwrap();
        for &handle in &tree.local_nodes[1..] {
            if let Some([left, right]) = tree.registry.get(handle).children() {
                assert!(position(left) < position(handle));
                assert!(position(right) < position(handle));
            }
        }
    }

    #[test]
    fn leaf_traversal_visits_exactly_the_leaves() {
        let tree = solo_tree(64, 8);
        let mut pool = TaskPool::start("traverse-test", 2);
        let visited = Arc::new(Mutex::new(Vec::new()));

        let visit: VisitFn = {
            let visited = visited.clone();
            Arc::new(move |handle| visited.lock().unwrap().push(handle))
        };
        tree.traverse_local_leaves(&mut pool, deps::write_self, Priority::Normal, visit);
        pool.drain().unwrap();

        let mut visited = visited.lock().unwrap().clone();
        visited.sort_unstable();
        let mut leaves = tree.leaves().to_vec();
        leaves.sort_unstable();
        assert_eq!(visited, leaves);
    }
}
