//! The distributed spatial/metric tree.
//!
//! Each rank owns an arena of nodes covering three different shapes of tree
//! node:
//!
//! 1. **Distributed nodes** form a chain from the global root down to this
//!    rank's local root, one per communicator-halving level. Each holds the
//!    communicator of the ranks cooperating on it, exactly one locally
//!    materialized child, and a lazily filled proxy for the remote sibling.
//! 2. **Local nodes** form the complete binary subtree below the local root,
//!    down to leaves of at most `leaf_size` indices.
//! 3. **Proxy nodes** stand in for remote nodes referenced by interaction
//!    lists or sampling: they carry only the essentials (identifier,
//!    skeletons, projection, sample pool, and index list for leaves), never
//!    the full remote state.
//!
//! Nodes are addressed by stable [`NodeHandle`]s; parent/child/sibling and
//! Near/Far relations are handles or identifiers, never pointers. The
//! identifier-to-handle registry is shared by worker threads during
//! interaction-list discovery and guarded by a single lock with
//! check-then-insert semantics.

pub mod build;
pub mod traverse;

use crate::comm::Communicator;
use crate::morton::MortonId;
use crate::runtime::ResourceId;
use crate::Gid;
use faer::Mat;
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stable handle of a node within one rank's arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) usize);

impl NodeHandle {
    /// The scheduling resource this node maps to.
    pub fn resource(self) -> ResourceId {
        ResourceId(self.0)
    }
}

/// Structural flavor of a node. Fixed at allocation.
#[derive(Copy, Clone, Debug)]
pub enum NodeKind {
    /// A node of the distributed chain: communicator size ≥ 2, exactly one
    /// locally materialized child, and a proxy for the remote sibling of
    /// that child.
    Distributed {
        child: NodeHandle,
        child_sibling: NodeHandle,
    },
    /// A single-process node with either two children or none (leaf).
    Local { children: Option<[NodeHandle; 2]> },
    /// Placeholder for a remote node, holding only locally needed data.
    Proxy,
}

/// Progression of one node through interaction-list construction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ListState {
    #[default]
    Unvisited,
    NearComputed,
    NearSymmetrized,
    FarComputed,
    Merged,
}

/// Mutable per-node state. Populated phase by phase and always accessed
/// under the node's lock; the task runtime's declared-intent discipline keeps
/// writers exclusive.
#[derive(Default)]
pub struct NodeData {
    /// Where this node stands in interaction-list construction.
    pub state: ListState,

    /// Indices owned by this rank at this node. For leaves this is the
    /// literal index set; for internal local nodes it is filled by the
    /// upward permutation pass; for distributed nodes it is this rank's
    /// share during construction.
    pub gids: Vec<Gid>,

    /// Total index count of the node across its communicator.
    pub count: usize,

    /// Identifiers of nodes requiring exact evaluation against this one.
    pub near: BTreeSet<MortonId>,

    /// Identifiers of nodes whose interaction with this one is compressed.
    pub far: BTreeSet<MortonId>,

    /// Per-neighbor-source candidate map built bottom-up during sampling:
    /// candidate column gid and its best observed distance, grouped by the
    /// candidate's leaf identifier so near-pruned groups can be dropped.
    pub candidates: BTreeMap<MortonId, BTreeMap<Gid, f64>>,

    /// Flattened sample pool (gid, best distance). On proxies this is the
    /// pool received for a remote sibling.
    pub pool: BTreeMap<Gid, f64>,

    /// Row sample drawn for the skeletonization block.
    pub sample_rows: Vec<Gid>,

    /// Sampled sub-block (rows × candidate columns) pending factorization.
    pub block: Option<Mat<f64>>,

    /// Skeleton columns selected by the interpolative decomposition.
    pub skeletons: Vec<Gid>,

    /// Projection mapping all candidate columns onto the skeleton basis.
    pub proj: Option<Mat<f64>>,

    /// Whether any nontrivial compression was found. `false` marks the node
    /// dense/unprunable, which is a valid outcome, not an error.
    pub compressed: bool,

    /// Skeleton weights accumulated by the upward pass.
    pub weights: Option<Mat<f64>>,

    /// Skeleton potentials accumulated from far interactions.
    pub potentials: Option<Mat<f64>>,

    /// Weight rows of a leaf's own indices (also cached on proxies of
    /// remote near leaves during evaluation).
    pub leaf_weights: Option<Mat<f64>>,

    /// Potential rows of a leaf's own indices.
    pub leaf_potentials: Option<Mat<f64>>,
}

/// One tree node. Structure (kind, level, communicator) is fixed at
/// allocation; the identifier is assigned exactly once when tree
/// construction completes; everything else lives in `data`.
pub struct Node {
    pub handle: NodeHandle,
    pub level: u32,
    pub kind: NodeKind,
    /// Communicator of the ranks cooperating on this node. `None` for local
    /// and proxy nodes.
    pub comm: Option<Communicator>,
    morton: OnceCell<MortonId>,
    data: RwLock<NodeData>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Local { children: None })
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.kind, NodeKind::Distributed { .. })
    }

    pub fn children(&self) -> Option<[NodeHandle; 2]> {
        match self.kind {
            NodeKind::Local { children } => children,
            _ => None,
        }
    }

    /// Identifier of this node. Panics if construction has not finished.
    pub fn morton(&self) -> MortonId {
        *self.morton.get().expect("node identifier not yet assigned")
    }

    pub fn try_morton(&self) -> Option<MortonId> {
        self.morton.get().copied()
    }

    pub fn set_morton(&self, id: MortonId) {
        // Assigned once at tree-build completion, immutable thereafter.
        let prev = self.morton.get_or_init(|| id);
        assert_eq!(*prev, id, "node identifier reassigned");
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NodeData> {
        self.data.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NodeData> {
        self.data.write().unwrap()
    }
}

/// The per-rank node arena plus the identifier→handle registry.
///
/// The arena is append-only: handles stay valid for the lifetime of a run,
/// and the whole structure is torn down at once at the end (no mid-run
/// deletion). The registry lock also serializes proxy creation
/// (check-then-insert).
pub struct Registry {
    nodes: RwLock<Vec<Arc<Node>>>,
    by_morton: Mutex<HashMap<MortonId, NodeHandle>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            by_morton: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a node and returns its handle.
    pub fn alloc(&self, level: u32, kind: NodeKind, comm: Option<Communicator>) -> NodeHandle {
        let mut nodes = self.nodes.write().unwrap();
        let handle = NodeHandle(nodes.len());
        nodes.push(Arc::new(Node {
            handle,
            level,
            kind,
            comm,
            morton: OnceCell::new(),
            data: RwLock::new(NodeData::default()),
        }));
        handle
    }

    pub fn get(&self, handle: NodeHandle) -> Arc<Node> {
        self.nodes.read().unwrap()[handle.0].clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `handle` under the identifier it carries.
    pub fn index(&self, handle: NodeHandle) {
        let morton = self.get(handle).morton();
        self.by_morton.lock().unwrap().insert(morton, handle);
    }

    /// Drops all identifier associations (used when identifiers are
    /// reassigned after a re-partition of a scratch tree).
    pub fn clear_index(&self) {
        self.by_morton.lock().unwrap().clear();
    }

    pub fn lookup(&self, morton: MortonId) -> Option<NodeHandle> {
        self.by_morton.lock().unwrap().get(&morton).copied()
    }

    /// Returns the handle registered for `morton`, creating a proxy node
    /// under the registry lock if none is known locally. Multiple workers
    /// race here during interaction-list discovery; the lock makes the
    /// check-then-insert atomic.
    pub fn proxy(&self, morton: MortonId) -> NodeHandle {
        let mut by_morton = self.by_morton.lock().unwrap();
        if let Some(handle) = by_morton.get(&morton) {
            return *handle;
        }
        let handle = self.alloc(morton.level(), NodeKind::Proxy, None);
        self.get(handle).set_morton(morton);
        by_morton.insert(morton, handle);
        handle
    }

    /// Snapshot of all handles currently in the arena.
    pub fn handles(&self) -> Vec<NodeHandle> {
        (0..self.len()).map(NodeHandle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_creation_is_idempotent() {
        let registry = Registry::new();
        let id = MortonId::new(3, 0b101);
        let a = registry.proxy(id);
        let b = registry.proxy(id);
        assert_eq!(a, b);
        assert_eq!(registry.get(a).morton(), id);
        assert!(matches!(registry.get(a).kind, NodeKind::Proxy));
    }

    #[test]
    fn identifier_is_write_once() {
        let registry = Registry::new();
        let handle = registry.alloc(0, NodeKind::Local { children: None }, None);
        let node = registry.get(handle);
        node.set_morton(MortonId::root());
        node.set_morton(MortonId::root());
        assert_eq!(node.morton(), MortonId::root());
    }

    #[test]
    #[should_panic(expected = "reassigned")]
    fn identifier_reassignment_is_a_defect() {
        let registry = Registry::new();
        let handle = registry.alloc(0, NodeKind::Local { children: None }, None);
        let node = registry.get(handle);
        node.set_morton(MortonId::root());
        node.set_morton(MortonId::new(1, 1));
    }
}
