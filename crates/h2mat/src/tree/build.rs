//! Distributed tree construction.
//!
//! Construction is two-phased. Allocation walks the communicator-halving
//! recursion first: one distributed node per halving level until every
//! rank's communicator has size 1, then the complete local subtree down to
//! the leaf-size threshold. Partitioning then runs the splitter over the
//! allocated skeleton as a task DAG (distributed chain top-down, local
//! subtree top-down), permutes index sets upward, and finishes by assigning
//! hierarchical identifiers and publishing the global gid→identifier table.

use super::traverse::deps;
use super::{NodeHandle, NodeKind, Registry};
use crate::comm::Communicator;
use crate::error::Error;
use crate::kernel::KernelOperator;
use crate::morton::MortonId;
use crate::runtime::{Priority, TaskPool};
use crate::splitter::{SplitInput, SplitPolicy};
use crate::tags;
use crate::Gid;
use h2mat_types::{CompressionConfig, ConfigError, DistanceMetric, Topology};
use std::ops::Deref;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// The per-rank view of the distributed tree. Cheap to clone; task bodies
/// capture clones.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

pub struct TreeInner {
    pub config: CompressionConfig,
    pub topology: Topology,
    /// World communicator of this rank.
    pub comm: Communicator,
    pub operator: Arc<dyn KernelOperator>,
    pub registry: Registry,
    /// Distributed chain, root first. The last entry is the local root
    /// (communicator size 1); every earlier entry is a distributed node.
    pub chain: Vec<NodeHandle>,
    /// Complete local subtree in level order; `local_nodes[0]` is the local
    /// root, children of slot `i` sit at `2i+1` and `2i+2`.
    pub local_nodes: Vec<NodeHandle>,
    /// Depth of the local subtree below the local root.
    pub local_depth: usize,
    /// Total tree depth: distributed levels + local depth.
    pub total_depth: usize,
    /// Identifier of the leaf owning each gid, filled at partition end and
    /// replicated on every rank.
    morton_of_gid: RwLock<Vec<MortonId>>,
}

impl Deref for Tree {
    type Target = TreeInner;

    fn deref(&self) -> &TreeInner {
        &self.inner
    }
}

// Task bodies capture `Tree` clones and run on pool workers.
static_assertions::assert_impl_all!(Tree: Send, Sync, Clone);

impl Tree {
    /// Allocates the node skeleton for `config` on this rank. Rejects
    /// configurations whose distributed recursion would outrun the leaf
    /// threshold, and metric/operator pairings that cannot work, before any
    /// construction starts.
    pub fn new(
        config: CompressionConfig,
        topology: Topology,
        comm: Communicator,
        operator: Arc<dyn KernelOperator>,
    ) -> Result<Tree, Error> {
        config.validate(&topology)?;
        if config.metric == DistanceMetric::Geometric && operator.geometry().is_none() {
            return Err(ConfigError::MetricRequiresGeometry(config.metric).into());
        }

        let registry = Registry::new();
        let levels = topology.levels();
        let total_depth = config.tree_depth();
        let local_depth = total_depth - levels;

        // The distributed chain: one node per halving level. Each node's
        // communicator is this rank's half of its parent's.
        let mut chain = Vec::with_capacity(levels + 1);
        let mut comms = Vec::with_capacity(levels + 1);
        let mut level_comm = comm.clone();
        for _ in 0..levels {
            comms.push(level_comm.clone());
            let (child, _) = level_comm.halve();
            level_comm = child;
        }

        // Local subtree allocated leaves-first so parents can link children,
        // then listed in level order.
        let local_root = alloc_local(&registry, levels as u32, local_depth);
        let mut local_nodes = vec![local_root];
        let mut cursor = 0;
        while cursor < local_nodes.len() {
            if let Some(children) = registry.get(local_nodes[cursor]).children() {
                local_nodes.extend(children);
            }
            cursor += 1;
        }

        // Chain nodes, deepest first, each linking to its child and the
        // proxy that will stand in for the child's remote sibling.
        let mut child = local_root;
        for level in (0..levels).rev() {
            let sibling = registry.alloc(level as u32 + 1, NodeKind::Proxy, None);
            let node = registry.alloc(
                level as u32,
                NodeKind::Distributed {
                    child,
                    child_sibling: sibling,
                },
                Some(comms[level].clone()),
            );
            chain.push(node);
            child = node;
        }
        chain.reverse();
        chain.push(local_root);

        debug!(
            rank = comm.world_rank(),
            levels, local_depth, "allocated tree skeleton"
        );

        let n = config.problem_size;
        Ok(Tree {
            inner: Arc::new(TreeInner {
                config,
                topology,
                comm,
                operator,
                registry,
                chain,
                local_nodes,
                local_depth,
                total_depth,
                morton_of_gid: RwLock::new(vec![MortonId::root(); n]),
            }),
        })
    }

    /// Handles of the local leaf nodes, left to right.
    pub fn leaves(&self) -> &[NodeHandle] {
        let first = (1 << self.local_depth) - 1;
        &self.local_nodes[first..]
    }

    /// Handles of local nodes at local level `level`, left to right.
    pub fn local_level(&self, level: usize) -> &[NodeHandle] {
        let first = (1 << level) - 1;
        let last = (1 << (level + 1)) - 1;
        &self.local_nodes[first..last]
    }

    /// Identifier of the leaf owning `gid`. Valid on every rank once
    /// partitioning completes.
    pub fn morton_of_gid(&self, gid: Gid) -> MortonId {
        self.morton_of_gid.read().unwrap()[gid]
    }

    /// The rank owning `morton` in the process group.
    pub fn owner_rank(&self, morton: MortonId) -> usize {
        morton.owner_rank(self.topology.levels() as u32)
    }

    /// The rank owning `gid` once partitioning completes.
    pub fn owner_of_gid(&self, gid: Gid) -> usize {
        self.owner_rank(self.morton_of_gid(gid))
    }

    /// Replicated gid→owner table, for the operator's routing.
    pub fn ownership_table(&self) -> Arc<Vec<u32>> {
        let morton = self.morton_of_gid.read().unwrap();
        let levels = self.topology.levels() as u32;
        Arc::new(morton.iter().map(|m| m.owner_rank(levels) as u32).collect())
    }

    /// Partitions the initially round-robin index distribution into the
    /// allocated skeleton using `policy`, then assigns identifiers.
    pub fn partition(&self, pool: &mut TaskPool, policy: Arc<dyn SplitPolicy>) -> Result<(), Error> {
        info!(rank = self.comm.world_rank(), "partitioning");

        // Initial round-robin ownership.
        let root = self.registry.get(self.chain[0]);
        {
            let mut data = root.write();
            data.gids = (self.comm.world_rank()..self.config.problem_size)
                .step_by(self.comm.world_size())
                .collect();
        }

        // Top-down splits: distributed chain first, then the local subtree.
        // One task per node; a node's split reads it and writes its
        // children, which serializes each level after its parent's.
        {
            let dist_policy = policy.clone();
            self.traverse_dist_down(pool, deps::read_self_write_children, Priority::High, {
                let tree = self.clone();
                Arc::new(move |node: NodeHandle| split_task(&tree, node, dist_policy.as_ref()))
            });
            self.traverse_local_down(pool, deps::read_self_write_children, Priority::Normal, {
                let tree = self.clone();
                Arc::new(move |node: NodeHandle| split_task(&tree, node, policy.as_ref()))
            });
        }
        pool.drain().map_err(panics_to_error)?;
        self.comm.barrier(tags::PHASE_BARRIER);

        // Upward index permutation: internal local nodes take the
        // concatenation of their children's index sets.
        self.traverse_local_up(pool, deps::write_self_read_children, Priority::Normal, {
            let tree = self.clone();
            Arc::new(move |handle: NodeHandle| {
                let node = tree.registry.get(handle);
                if let Some([left, right]) = node.children() {
                    let mut gids = tree.registry.get(left).read().gids.clone();
                    gids.extend_from_slice(&tree.registry.get(right).read().gids);
                    let mut data = node.write();
                    data.count = gids.len();
                    data.gids = gids;
                } else {
                    let mut data = node.write();
                    data.count = data.gids.len();
                }
            })
        });
        pool.drain().map_err(panics_to_error)?;

        self.assign_identifiers();
        self.comm.barrier(tags::PHASE_BARRIER.next());
        info!(rank = self.comm.world_rank(), "partitioned");
        Ok(())
    }

    /// Recursive identifier assignment, followed by the global gather that
    /// lets every rank resolve containment queries locally.
    fn assign_identifiers(&self) {
        let levels = self.topology.levels();
        let rank = self.comm.world_rank() as u64;

        // Chain nodes: the path of the level-l node is the top l bits of
        // this rank. Sibling proxies get the opposite direction bit.
        for (level, &handle) in self.chain.iter().enumerate() {
            let path = rank >> (levels - level);
            let node = self.registry.get(handle);
            node.set_morton(MortonId::new(level as u32, path));
            if let NodeKind::Distributed { child_sibling, .. } = node.kind {
                let child_path = rank >> (levels - level - 1);
                self.registry
                    .get(child_sibling)
                    .set_morton(MortonId::new(level as u32 + 1, child_path ^ 1));
            }
        }

        // Local subtree: (parentCode, directionBit) recursion in level
        // order; slot arithmetic gives the direction bit for free.
        let local_root_id = MortonId::new(levels as u32, rank);
        for (slot, &handle) in self.local_nodes.iter().enumerate() {
            let node = self.registry.get(handle);
            if slot == 0 {
                node.set_morton(local_root_id);
            }
            if let Some([left, right]) = node.children() {
                let id = node.morton();
                self.registry.get(left).set_morton(id.left_child());
                self.registry.get(right).set_morton(id.right_child());
            }
        }

        // Gather (gid, identifier) pairs of owned leaves and broadcast them
        // across the run, so containment queries never need communication.
        let mut pairs: Vec<(Gid, MortonId)> = Vec::new();
        for &leaf in self.leaves() {
            let node = self.registry.get(leaf);
            let id = node.morton();
            for &gid in &node.read().gids {
                pairs.push((gid, id));
            }
        }
        let all_pairs = self.comm.allgatherv(tags::MORTON_GATHER, pairs);
        {
            let mut table = self.morton_of_gid.write().unwrap();
            assert_eq!(all_pairs.len(), table.len(), "leaf index sets must partition the problem");
            for (gid, id) in all_pairs {
                table[gid] = id;
            }
        }

        // Rebuild the identifier registry for every materialized node.
        self.registry.clear_index();
        for &handle in self.chain.iter().chain(self.local_nodes.iter()) {
            self.registry.index(handle);
            if let NodeKind::Distributed { child_sibling, .. } = self.registry.get(handle).kind {
                self.registry.index(child_sibling);
            }
        }
    }
}

/// Allocates the complete local subtree of `depth` below `level`,
/// returning the subtree root. Children are allocated before parents so
/// the parent's kind can link them.
fn alloc_local(registry: &Registry, level: u32, depth: usize) -> NodeHandle {
    if depth == 0 {
        return registry.alloc(level, NodeKind::Local { children: None }, None);
    }
    let left = alloc_local(registry, level + 1, depth - 1);
    let right = alloc_local(registry, level + 1, depth - 1);
    registry.alloc(
        level,
        NodeKind::Local {
            children: Some([left, right]),
        },
        None,
    )
}

/// Body of one split task: decide membership, exchange index sets with the
/// partner rank (distributed nodes), and populate the children.
fn split_task(tree: &Tree, handle: NodeHandle, policy: &dyn SplitPolicy) {
    let node = tree.registry.get(handle);
    let level = node.level;
    let seed = tree
        .config
        .seed
        .wrapping_add((level as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add((handle.0 as u64) << 32);

    match &node.kind {
        NodeKind::Distributed {
            child: child_handle,
            ..
        } => {
            let comm = node.comm.as_ref().expect("distributed node without comm");
            let gids = node.read().gids.clone();
            let total = comm.allreduce(tags::SPLIT_COUNT.at_level(level), gids.len(), |a, b| a + b);
            node.write().count = total;

            let parts = policy.split(&SplitInput {
                operator: tree.operator.as_ref(),
                metric: tree.config.metric,
                gids: &gids,
                comm,
                level,
                seed,
            });

            // Lower half keeps the left part, upper half the right; the
            // rest crosses over to the partner rank.
            let upper = comm.rank() >= comm.size() / 2;
            let (kept_idx, sent_idx) = if upper {
                (&parts.right, &parts.left)
            } else {
                (&parts.left, &parts.right)
            };
            let kept: Vec<Gid> = kept_idx.iter().map(|&i| gids[i]).collect();
            let sent: Vec<Gid> = sent_idx.iter().map(|&i| gids[i]).collect();

            let partner = comm.partner();
            let received: Vec<Gid> =
                comm.sendrecv(partner, tags::SPLIT_EXCHANGE.at_level(level), sent.clone());
            tree.operator.redistribute(comm, partner, &sent, &received);

            let child = tree.registry.get(*child_handle);
            let mut data = child.write();
            data.gids = kept;
            data.gids.extend_from_slice(&received);
            drop(data);
            comm.barrier(tags::SPLIT_DONE.at_level(level));
        }
        NodeKind::Local { children } => {
            let Some([left, right]) = children else {
                // Leaf: count only.
                let mut data = node.write();
                data.count = data.gids.len();
                return;
            };
            let solo = tree.comm.solo();
            let gids = node.read().gids.clone();
            node.write().count = gids.len();
            let parts = policy.split(&SplitInput {
                operator: tree.operator.as_ref(),
                metric: tree.config.metric,
                gids: &gids,
                comm: &solo,
                level,
                seed,
            });
            tree.registry.get(*left).write().gids =
                parts.left.iter().map(|&i| gids[i]).collect();
            tree.registry.get(*right).write().gids =
                parts.right.iter().map(|&i| gids[i]).collect();
        }
        NodeKind::Proxy => unreachable!("proxies are never split"),
    }
}

pub(crate) fn panics_to_error(panics: Vec<crate::error::WorkerPanicInfo>) -> Error {
    Error::WorkerPanic {
        panic_info: panics
            .into_iter()
            .map(|info| (crate::runtime::Runtime::rank(), info))
            .collect(),
    }
}
