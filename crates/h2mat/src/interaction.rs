//! Near/Far interaction lists.
//!
//! Per node, list construction walks a fixed progression: near discovery at
//! the leaves, cross-rank near symmetrization, far discovery and bottom-up
//! merge, then far symmetrization. Near(leaf) is seeded from the leaf's
//! neighbor ballots under the pruning budget; a leaf with no neighbor
//! information falls back to every other leaf (nothing can be pruned for
//! it). Far(node) comes from a top-down recursion over hypothetical sibling
//! identifiers: an identifier containing no member of Near(target) is
//! prunable and becomes a Far entry, anything else recurses until leaf
//! depth.
//!
//! Local discovery cannot see relations contributed by other ranks, so each
//! symmetrization pass routes `(observed, self)` pairs to the rank owning
//! `observed` and inserts the missing back-references there, creating proxy
//! nodes under the registry lock as needed.

use crate::comm::Communicator;
use crate::error::Error;
use crate::morton::MortonId;
use crate::runtime::{Priority, TaskPool};
use crate::tags;
use crate::tree::build::{panics_to_error, Tree};
use crate::tree::traverse::deps;
use crate::tree::{ListState, NodeKind};
use crate::Gid;
use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Seeds Near(leaf) from neighbor ballots, bounded by the pruning budget.
pub fn find_near(
    tree: &Tree,
    pool: &mut TaskPool,
    neighbors: Arc<HashMap<Gid, Vec<(f64, Gid)>>>,
) -> Result<(), Error> {
    let total_leaves = 1usize << tree.total_depth;
    // The budget is the fraction of leaf interactions exempted from
    // compression: it caps how many near partners one leaf may take.
    let cap = ((tree.config.budget * total_leaves as f64).ceil() as usize).max(1);

    let visit = {
        let tree = tree.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            let own = node.morton();
            let gids = node.read().gids.clone();

            let mut ballot: HashMap<MortonId, usize> = HashMap::new();
            let mut saw_neighbors = false;
            for gid in gids {
                if let Some(list) = neighbors.get(&gid) {
                    saw_neighbors = !list.is_empty() || saw_neighbors;
                    for &(_, ngid) in list {
                        let leaf = tree.morton_of_gid(ngid);
                        if leaf != own {
                            *ballot.entry(leaf).or_default() += 1;
                        }
                    }
                }
            }

            let mut data = node.write();
            debug_assert!(matches!(data.state, ListState::Unvisited));
            data.near.insert(own);
            if !saw_neighbors {
                // No neighbor information: this leaf cannot be pruned
                // against anything, so every leaf is near.
                for path in 0..(1u64 << tree.total_depth) {
                    data.near.insert(MortonId::new(tree.total_depth as u32, path));
                }
            } else {
                // Most-voted partners first, identifiers as tie-break.
                let mut votes: Vec<(usize, MortonId)> =
                    ballot.into_iter().map(|(m, v)| (v, m)).collect();
                votes.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                for (_, m) in votes.into_iter().take(cap) {
                    data.near.insert(m);
                }
            }
            data.state = ListState::NearComputed;
        })
    };
    tree.traverse_local_leaves(pool, deps::write_self, Priority::Normal, visit);
    pool.drain().map_err(panics_to_error)?;
    Ok(())
}

/// Cross-rank near symmetrization: for every observed identifier, the
/// observing leaf registers itself with the observer's owner.
pub fn symmetrize_near(tree: &Tree, comm: &Communicator, round: u64) -> Result<(), Error> {
    let ranks = comm.world_size();
    let mut sends: Vec<Vec<(MortonId, MortonId)>> = vec![Vec::new(); ranks];
    for &handle in tree.leaves() {
        let node = tree.registry.get(handle);
        let own = node.morton();
        for &observed in node.read().near.iter() {
            sends[tree.owner_rank(observed)].push((observed, own));
        }
    }
    let received = comm.alltoallv(tags::NEAR_SYMMETRIZE.seq(round), sends);

    for (observed, source) in received.into_iter().flatten() {
        let handle = tree
            .registry
            .lookup(observed)
            .expect("near symmetrization routed to a rank that does not own the node");
        // Materialize the source if it is remote; insertion itself happens
        // under the node's own lock.
        tree.registry.proxy(source);
        let node = tree.registry.get(handle);
        let mut data = node.write();
        data.near.insert(source);
        data.state = ListState::NearSymmetrized;
    }
    comm.barrier(tags::NEAR_SYMMETRIZE.seq(round).next());
    Ok(())
}

/// Top-down far discovery for one target node: recurse from the root,
/// emitting every identifier whose subtree avoids Near(target).
fn find_far(
    tree: &Tree,
    target: MortonId,
    near: &BTreeSet<MortonId>,
    level: u32,
    path: u64,
    symmetric: bool,
    out: &mut BTreeSet<MortonId>,
) {
    let candidate = MortonId::new(level, path);
    let prunable = !near.iter().any(|m| candidate.contains(*m));
    if prunable {
        if symmetric && candidate.position() < target.position() {
            // The mirrored relation is (or will be) recorded by the owner
            // of the smaller identifier; symmetrization restores this side.
            return;
        }
        tree.registry.proxy(candidate);
        out.insert(candidate);
    } else if level < target.level() {
        find_far(tree, target, near, level + 1, path << 1, symmetric, out);
        find_far(tree, target, near, level + 1, (path << 1) | 1, symmetric, out);
    }
}

/// Far discovery and bottom-up merge.
///
/// Leaves run the top-down recursion against their near lists; internal
/// local nodes take the intersection of their children's lists (and remove
/// it from the children: the parent now covers those relations at coarser
/// granularity); distributed nodes do the same with the remote sibling's
/// list obtained by pairwise exchange.
pub fn merge_far(tree: &Tree, pool: &mut TaskPool, symmetric: bool) -> Result<(), Error> {
    let leaf_visit = {
        let tree = tree.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            let target = node.morton();
            let near = node.read().near.clone();
            let mut far = BTreeSet::new();
            find_far(&tree, target, &near, 0, 0, symmetric, &mut far);
            let mut data = node.write();
            data.far = far;
            data.state = ListState::FarComputed;
        })
    };

    let merge_visit = {
        let tree = tree.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            match &node.kind {
                NodeKind::Local {
                    children: Some([left, right]),
                } => {
                    let left = tree.registry.get(*left);
                    let right = tree.registry.get(*right);
                    let common: BTreeSet<MortonId> = {
                        let l = left.read();
                        let r = right.read();
                        l.far.intersection(&r.far).copied().collect()
                    };
                    for m in &common {
                        left.write().far.remove(m);
                        right.write().far.remove(m);
                    }
                    let mut data = node.write();
                    data.far = common;
                    data.state = ListState::FarComputed;
                }
                NodeKind::Distributed { child, .. } => {
                    let comm = node.comm.as_ref().expect("distributed node without comm");
                    let child = tree.registry.get(*child);
                    let child_far = child.read().far.clone();
                    let sibling_far: BTreeSet<MortonId> = comm.sendrecv(
                        comm.partner(),
                        tags::FAR_MERGE.at_level(node.level),
                        child_far.clone(),
                    );
                    let common: BTreeSet<MortonId> =
                        child_far.intersection(&sibling_far).copied().collect();
                    {
                        let mut child_data = child.write();
                        for m in &common {
                            child_data.far.remove(m);
                        }
                    }
                    let mut data = node.write();
                    data.far = common;
                    data.state = ListState::FarComputed;
                }
                _ => {}
            }
        })
    };

    // Leaves first (discovery), then the local merge upward, then the
    // distributed chain. The chain visit of the local root is the local
    // merge of its two children.
    tree.traverse_local_leaves(pool, deps::write_self, Priority::Normal, leaf_visit);
    tree.traverse_local_up(
        pool,
        deps::write_self_write_children,
        Priority::Normal,
        merge_visit.clone(),
    );
    tree.traverse_dist_up(
        pool,
        deps::write_self_write_children,
        Priority::High,
        merge_visit,
    );
    pool.drain().map_err(panics_to_error)?;
    Ok(())
}

/// Cross-rank far symmetrization, with a final broadcast keeping the
/// distributed chain's replicas aligned.
pub fn symmetrize_far(tree: &Tree, comm: &Communicator, round: u64) -> Result<(), Error> {
    let ranks = comm.world_size();
    let mut sends: Vec<Vec<(MortonId, MortonId)>> = vec![Vec::new(); ranks];

    // Local nodes below the local root; every rank's lists are unique.
    for &handle in &tree.local_nodes[1..] {
        let node = tree.registry.get(handle);
        let own = node.morton();
        for &observed in node.read().far.iter() {
            sends[tree.owner_rank(observed)].push((observed, own));
        }
    }
    // Chain nodes are replicated across their communicator; only the
    // owner's copy speaks for them.
    for &handle in &tree.chain {
        let node = tree.registry.get(handle);
        if node.comm.as_ref().map_or(true, |c| c.rank() == 0) {
            let own = node.morton();
            for &observed in node.read().far.iter() {
                sends[tree.owner_rank(observed)].push((observed, own));
            }
        }
    }

    let received = comm.alltoallv(tags::FAR_SYMMETRIZE.seq(round), sends);
    for (observed, source) in received.into_iter().flatten() {
        let handle = tree
            .registry
            .lookup(observed)
            .expect("far symmetrization routed to a rank that does not own the node");
        tree.registry.proxy(source);
        let node = tree.registry.get(handle);
        let mut data = node.write();
        data.far.insert(source);
    }
    comm.barrier(tags::FAR_SYMMETRIZE.seq(round).next());

    // Re-align chain replicas with the owner's (possibly grown) lists.
    for &handle in &tree.chain {
        let node = tree.registry.get(handle);
        let Some(node_comm) = node.comm.as_ref() else {
            continue;
        };
        let own_far = (node_comm.rank() == 0).then(|| node.read().far.clone());
        let far = node_comm.broadcast(0, tags::FAR_REPLICATE.at_level(node.level).seq(round), own_far);
        let mut data = node.write();
        data.far = far;
        data.state = ListState::Merged;
    }
    for &handle in tree.local_nodes.iter() {
        let node = tree.registry.get(handle);
        node.write().state = ListState::Merged;
    }
    Ok(())
}

/// Debugging/verification aid: reduces every Near and Far relation to
/// leaf-by-leaf granularity and counts how often each ordered leaf pair is
/// covered. On rank 0 the returned table must hold exactly one for every
/// cell if the lists partition the interaction space; other ranks get
/// `None`.
pub fn check_interactions(tree: &Tree, comm: &Communicator) -> Option<Vec<Vec<u32>>> {
    let depth = tree.total_depth as u32;
    let n_leaves = 1usize << depth;
    let mut table = vec![vec![0u32; n_leaves]; n_leaves];

    let leaves_under = |m: MortonId| -> std::ops::Range<u64> {
        let shift = depth - m.level();
        (m.path() << shift)..((m.path() + 1) << shift)
    };

    let mut count = |a: MortonId, b: MortonId| {
        for i in leaves_under(a) {
            for j in leaves_under(b) {
                table[i as usize][j as usize] += 1;
            }
        }
    };

    for &handle in tree.local_nodes.iter() {
        let node = tree.registry.get(handle);
        let own = node.morton();
        let data = node.read();
        if node.is_leaf() {
            for &m in &data.near {
                count(own, m);
            }
        }
        for &m in &data.far {
            count(own, m);
        }
    }
    for &handle in &tree.chain {
        let node = tree.registry.get(handle);
        // The local root was already counted with the local nodes.
        if !node.is_distributed() {
            continue;
        }
        if node.comm.as_ref().map_or(true, |c| c.rank() == 0) {
            let own = node.morton();
            for &m in &tree.registry.get(handle).read().far {
                count(own, m);
            }
        }
    }

    let flat: Vec<u32> = table.into_iter().flatten().collect();
    let reduced = comm.reduce(tags::CHECK_REDUCE, flat, |mut a, b| {
        for (x, y) in a.iter_mut().zip(b) {
            *x += y;
        }
        a
    });
    reduced.map(|flat| {
        flat.chunks(n_leaves)
            .map(|chunk| chunk.to_vec())
            .collect()
    })
}

/// Conservative handling of dense/unprunable nodes, run after
/// skeletonization: any far relation touching a node that found no
/// compression is demoted back to exact leaf-level near interactions, then
/// near symmetry is restored.
pub fn demote_uncompressed_far(
    tree: &Tree,
    comm: &Communicator,
) -> Result<(), Error> {
    // Every rank announces the uncompressed nodes it owns.
    // The root is never skeletonized and never appears in a far list, so
    // it is excluded here.
    let mut local_bad: Vec<MortonId> = Vec::new();
    for &handle in tree.local_nodes.iter() {
        let node = tree.registry.get(handle);
        if node.morton().level() > 0 && !node.read().compressed {
            local_bad.push(node.morton());
        }
    }
    for &handle in &tree.chain {
        let node = tree.registry.get(handle);
        if node.morton().level() > 0
            && node.comm.as_ref().map_or(true, |c| c.rank() == 0)
            && !node.read().compressed
        {
            local_bad.push(node.morton());
        }
    }
    let bad: BTreeSet<MortonId> = comm
        .allgatherv(tags::DEMOTE_GATHER, local_bad)
        .into_iter()
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    debug!(count = bad.len(), "demoting far relations of uncompressed nodes");

    let leaf_level = tree.total_depth as u32;
    let leaves_under = |m: MortonId| -> Vec<MortonId> {
        let span = 1u64 << (leaf_level - m.level());
        (0..span)
            .map(|i| MortonId::new(leaf_level, (m.path() << (leaf_level - m.level())) + i))
            .collect()
    };

    for &handle in tree.local_nodes.iter().chain(tree.chain.iter()) {
        let node = tree.registry.get(handle);
        let own = node.morton();
        let demoted: Vec<MortonId> = {
            let mut data = node.write();
            let doomed: Vec<MortonId> = data
                .far
                .iter()
                .copied()
                .filter(|m| bad.contains(m) || bad.contains(&own))
                .collect();
            for m in &doomed {
                data.far.remove(m);
            }
            doomed
        };
        if demoted.is_empty() {
            continue;
        }
        // Expand both sides to leaves; register the pairs on the leaves of
        // this node that this rank owns.
        let own_leaves: Vec<crate::tree::NodeHandle> = tree
            .leaves()
            .iter()
            .copied()
            .filter(|&h| own.contains(tree.registry.get(h).morton()))
            .collect();
        for m in demoted {
            for partner_leaf in leaves_under(m) {
                tree.registry.proxy(partner_leaf);
                for &leaf in &own_leaves {
                    let leaf_node = tree.registry.get(leaf);
                    if leaf_node.morton() != partner_leaf {
                        leaf_node.write().near.insert(partner_leaf);
                    }
                }
            }
        }
    }

    // Restore near symmetry for the newly added pairs.
    symmetrize_near(tree, comm, 1)
}
