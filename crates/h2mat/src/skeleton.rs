//! Skeletonization: low-rank interpolative approximation per node.
//!
//! Two phases, both upward.
//!
//! **Pool building** merges each node's sample-candidate pool bottom-up from
//! its children, dropping near-pruned entries and anything inside the node's
//! own subtree. Leaves seed their pools from neighbor lists. On the
//! distributed chain the merge is a pairwise exchange: the rank holding a
//! node's data receives the remote half's near list and candidates from its
//! partner.
//!
//! **Skeletonization** draws a row sample from the pool (closest first,
//! random validated fill after), assembles the sampled sub-block, and runs
//! the rank-revealing interpolative decomposition. The tolerance handed to
//! the rank-revealing step is scaled per node so the expected approximation
//! error stays roughly uniform across tree levels. On the distributed chain
//! the decomposition executes only on the rank holding the node's data; the
//! resulting flag, skeleton list and projection are then broadcast to every
//! rank of the node's communicator before any task that reads them may run.
//!
//! A node for which no compression is found (children incompressible, or
//! the decomposition cannot meet tolerance within the rank budget) is a
//! valid dense/unprunable outcome; downstream passes treat it
//! conservatively.

use crate::error::Error;
use crate::linalg;
use crate::morton::MortonId;
use crate::runtime::{Priority, TaskPool};
use crate::tags;
use crate::tree::build::{panics_to_error, Tree};
use crate::tree::traverse::deps;
use crate::tree::{Node, NodeKind};
use crate::Gid;
use faer::Mat;
use hashbrown::HashMap;
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Extra rows beyond the rank budget tolerated before the sampled block is
/// compressed with a Gaussian sketch.
const OVERSAMPLE_SLACK: usize = 20;

/// Builds every node's candidate pool bottom-up.
pub fn build_pools(
    tree: &Tree,
    pool: &mut TaskPool,
    neighbors: Arc<HashMap<Gid, Vec<(f64, Gid)>>>,
) -> Result<(), Error> {
    let local_visit = {
        let tree = tree.clone();
        let neighbors = neighbors.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            match node.children() {
                None => seed_leaf_pool(&tree, &node, &neighbors),
                Some(children) => merge_child_pools(&tree, &node, children),
            }
        })
    };

    let dist_visit = {
        let tree = tree.clone();
        let neighbors = neighbors.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            match &node.kind {
                // The local root: plain local semantics (a leaf when the
                // local subtree has depth zero).
                NodeKind::Local { children: None } => seed_leaf_pool(&tree, &node, &neighbors),
                NodeKind::Local {
                    children: Some(children),
                } => merge_child_pools(&tree, &node, *children),
                NodeKind::Distributed { child, .. } => {
                    merge_dist_pools(&tree, &node, *child);
                }
                NodeKind::Proxy => unreachable!("proxies are not traversed"),
            }
        })
    };

    tree.traverse_local_up(
        pool,
        deps::write_self_write_children,
        Priority::Normal,
        local_visit,
    );
    tree.traverse_dist_up(
        pool,
        deps::write_self_write_children,
        Priority::High,
        dist_visit,
    );
    pool.drain().map_err(panics_to_error)?;
    Ok(())
}

/// Leaf pools come straight from the neighbor lists, minus near-pruned
/// partners.
fn seed_leaf_pool(tree: &Tree, node: &Arc<Node>, neighbors: &HashMap<Gid, Vec<(f64, Gid)>>) {
    let own = node.morton();
    let (gids, near) = {
        let data = node.read();
        (data.gids.clone(), data.near.clone())
    };
    let mut candidates: BTreeMap<MortonId, BTreeMap<Gid, f64>> = BTreeMap::new();
    for gid in gids {
        for &(distance, ngid) in neighbors.get(&gid).map(Vec::as_slice).unwrap_or(&[]) {
            let leaf = tree.morton_of_gid(ngid);
            if leaf == own || near.contains(&leaf) {
                continue;
            }
            let slot = candidates.entry(leaf).or_default().entry(ngid).or_insert(distance);
            *slot = slot.min(distance);
        }
    }
    let mut data = node.write();
    data.pool = flatten(&candidates);
    data.candidates = candidates;
}

/// Internal nodes merge their children's pools, dropping entries that fell
/// inside the (now bigger) subtree, then release the children's candidates.
fn merge_child_pools(tree: &Tree, node: &Arc<Node>, children: [crate::tree::NodeHandle; 2]) {
    let own = node.morton();
    let mut merged: BTreeMap<MortonId, BTreeMap<Gid, f64>> = BTreeMap::new();
    for child in children {
        let child = tree.registry.get(child);
        let mut child_data = child.write();
        for (leaf, entries) in std::mem::take(&mut child_data.candidates) {
            if own.contains(leaf) {
                continue;
            }
            let merged_entries = merged.entry(leaf).or_default();
            for (gid, distance) in entries {
                let slot = merged_entries.entry(gid).or_insert(distance);
                *slot = slot.min(distance);
            }
        }
    }
    let mut data = node.write();
    data.pool = flatten(&merged);
    data.candidates = merged;
}

/// Distributed merge: the node's data lives on communicator rank 0, which
/// receives the remote half's near list and candidates from the partner
/// rank. Near entries propagate upward here too (minus anything the node
/// itself now covers), so coarse levels can keep filtering their pools.
fn merge_dist_pools(tree: &Tree, node: &Arc<Node>, child: crate::tree::NodeHandle) {
    let comm = node.comm.as_ref().expect("distributed node without comm");
    let own = node.morton();
    let child = tree.registry.get(child);
    let tag = tags::POOL_MERGE.at_level(node.level);

    if comm.rank() == 0 {
        let (remote_near, remote_flat): (Vec<MortonId>, Vec<(Gid, f64)>) =
            comm.recv(comm.size() / 2, tag);

        let (child_near, mut merged) = {
            let mut child_data = child.write();
            (
                child_data.near.clone(),
                std::mem::take(&mut child_data.candidates),
            )
        };

        let mut data = node.write();
        for m in child_near.into_iter().chain(remote_near) {
            if !own.contains(m) {
                data.near.insert(m);
            }
        }
        for (gid, distance) in remote_flat {
            let leaf = tree.morton_of_gid(gid);
            let slot = merged.entry(leaf).or_default().entry(gid).or_insert(distance);
            *slot = slot.min(distance);
        }
        merged.retain(|leaf, _| !own.contains(*leaf) && !data.near.contains(leaf));
        data.pool = flatten(&merged);
        data.candidates = merged;
    } else {
        if comm.rank() == comm.size() / 2 {
            let mut child_data = child.write();
            let near: Vec<MortonId> = child_data.near.iter().copied().collect();
            let flat: Vec<(Gid, f64)> = child_data
                .candidates
                .values()
                .flat_map(|entries| entries.iter().map(|(&g, &d)| (g, d)))
                .collect();
            comm.send(0, tag, (near, flat));
            child_data.candidates.clear();
        } else {
            child.write().candidates.clear();
        }
    }
    comm.barrier(tag.seq(1));
}

fn flatten(candidates: &BTreeMap<MortonId, BTreeMap<Gid, f64>>) -> BTreeMap<Gid, f64> {
    let mut pool = BTreeMap::new();
    for entries in candidates.values() {
        for (&gid, &distance) in entries {
            let slot = pool.entry(gid).or_insert(distance);
            *slot = slot.min(distance);
        }
    }
    pool
}

/// Skeletonizes every node bottom-up: local subtree first, then the
/// distributed chain with its broadcast barrier.
pub fn skeletonize(tree: &Tree, pool: &mut TaskPool) -> Result<(), Error> {
    let local_visit = {
        let tree = tree.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            skeletonize_local(&tree, &node);
        })
    };
    let dist_visit = {
        let tree = tree.clone();
        Arc::new(move |handle: crate::tree::NodeHandle| {
            let node = tree.registry.get(handle);
            match &node.kind {
                NodeKind::Local { .. } => skeletonize_local(&tree, &node),
                NodeKind::Distributed { .. } => skeletonize_dist(&tree, &node),
                NodeKind::Proxy => unreachable!("proxies are not traversed"),
            }
        })
    };

    tree.traverse_local_up(
        pool,
        deps::write_self_read_children,
        Priority::Normal,
        local_visit,
    );
    tree.traverse_dist_up(
        pool,
        deps::write_self_read_children,
        Priority::High,
        dist_visit,
    );
    pool.drain().map_err(panics_to_error)?;
    Ok(())
}

/// Candidate columns of a node: its own indices at a leaf, the
/// concatenation of both children's skeletons otherwise. `None` marks the
/// node incompressible because a child already is.
fn candidate_columns(tree: &Tree, node: &Arc<Node>) -> Option<Vec<Gid>> {
    match node.children() {
        None => Some(node.read().gids.clone()),
        Some([left, right]) => {
            let left = tree.registry.get(left);
            let right = tree.registry.get(right);
            let l = left.read();
            let r = right.read();
            if !l.compressed || !r.compressed {
                return None;
            }
            let mut cols = l.skeletons.clone();
            cols.extend_from_slice(&r.skeletons);
            Some(cols)
        }
    }
}

fn skeletonize_local(tree: &Tree, node: &Arc<Node>) {
    // The global root is nobody's far field; it never skeletonizes.
    if node.morton().level() == 0 {
        node.write().compressed = false;
        return;
    }
    let Some(cols) = candidate_columns(tree, node) else {
        node.write().compressed = false;
        return;
    };
    let count = node.read().count;
    let outcome = factor_block(tree, node, &cols, count);
    let mut data = node.write();
    apply_outcome(&mut data, outcome);
    data.pool.clear();
    data.candidates.clear();
}

/// Distributed skeletonization: rank 0 of the node's communicator gathers
/// the sibling half's skeletons, factors, and broadcasts the result. The
/// broadcast is the hard synchronization point: no rank can run a task
/// reading this node's skeletons before it completes.
fn skeletonize_dist(tree: &Tree, node: &Arc<Node>) {
    let comm = node.comm.as_ref().expect("distributed node without comm");
    let NodeKind::Distributed { child, .. } = &node.kind else {
        unreachable!()
    };
    let child = tree.registry.get(*child);
    let tag = tags::SKELETONIZE.at_level(node.level);

    if comm.rank() == comm.size() / 2 {
        let child_data = child.read();
        comm.send(
            0,
            tag,
            (child_data.compressed, child_data.skeletons.clone()),
        );
    }

    let outcome = if comm.rank() == 0 {
        let root_level = node.morton().level() == 0;
        let (remote_ok, remote_skels): (bool, Vec<Gid>) = comm.recv(comm.size() / 2, tag);
        let child_data = child.read();
        if root_level || !child_data.compressed || !remote_ok {
            None
        } else {
            let mut cols = child_data.skeletons.clone();
            cols.extend_from_slice(&remote_skels);
            drop(child_data);
            let count = node.read().count;
            factor_block(tree, node, &cols, count)
        }
    } else {
        None
    };

    // Hard barrier: flag, skeletons and projection reach every rank of the
    // group before anything downstream reads them.
    let broadcast = (comm.rank() == 0).then(|| match outcome {
        Some((skeletons, proj)) => (true, skeletons, Some(proj)),
        None => (false, Vec::new(), None),
    });
    let (compressed, skeletons, proj) = comm.broadcast(0, tag.seq(1), broadcast);

    let mut data = node.write();
    data.compressed = compressed;
    data.skeletons = skeletons;
    data.proj = proj;
    data.pool.clear();
    data.candidates.clear();
}

/// Samples rows, assembles the sampled sub-block, and runs the
/// rank-revealing step. Returns the skeleton gids and projection, or `None`
/// when the node is incompressible.
fn factor_block(
    tree: &Tree,
    node: &Arc<Node>,
    cols: &[Gid],
    node_size: usize,
) -> Option<(Vec<Gid>, Mat<f64>)> {
    if cols.is_empty() {
        return None;
    }
    let own = node.morton();
    let config = &tree.config;
    let n_total = tree.operator.size();
    let seed = config
        .seed
        .wrapping_add(0x5ce1_e707)
        .wrapping_add((node.handle.0 as u64) << 20);

    let nsamples = (2 * cols.len()).max(2 * config.leaf_size);
    let pool = node.read().pool.clone();
    let rows = sample_rows(tree, own, &pool, nsamples, node_size, seed);
    if rows.is_empty() {
        return None;
    }

    let mut block = tree.operator.block(&rows, cols);

    // Tall sampled blocks are sketched down with a Gaussian projection
    // before pivoting.
    let sketch_rows = config.max_rank + OVERSAMPLE_SLACK;
    if block.nrows() > sketch_rows {
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x6a55);
        let gauss: Mat<f64> =
            Mat::from_fn(sketch_rows, block.nrows(), |_, _| rng.sample(StandardNormal));
        block = &gauss * &block;
    }

    // Per-node tolerance scaling: the sampled row and column fractions both
    // shrink the observable error, so the rank-revealing step gets a
    // proportionally tighter target.
    let m = block.nrows() as f64;
    let n = block.ncols() as f64;
    let q = node_size.max(1) as f64;
    let remainder = (n_total as f64 - q).max(1.0);
    let scaled_tol = (n / q).sqrt()
        * (m / remainder).sqrt()
        * config.tolerance
        * (q / n_total as f64).sqrt();

    let id = linalg::interpolative(&block, config.max_rank, scaled_tol)?;
    if id.skeleton.is_empty() {
        return None;
    }
    trace!(
        node = ?own,
        rank = id.skeleton.len(),
        cols = cols.len(),
        "skeletonized"
    );
    let skeletons: Vec<Gid> = id.skeleton.iter().map(|&j| cols[j]).collect();
    Some((skeletons, id.proj))
}

fn apply_outcome(data: &mut crate::tree::NodeData, outcome: Option<(Vec<Gid>, Mat<f64>)>) {
    match outcome {
        Some((skeletons, proj)) => {
            data.skeletons = skeletons;
            data.proj = Some(proj);
            data.compressed = true;
        }
        None => {
            data.skeletons = Vec::new();
            data.proj = None;
            data.compressed = false;
        }
    }
}

/// Draws `nsamples` distinct row gids outside the node's subtree: pool
/// entries closest-first, then seeded random gids validated against the
/// subtree until the sample is full (or everything outside is taken).
fn sample_rows(
    tree: &Tree,
    own: MortonId,
    pool: &BTreeMap<Gid, f64>,
    nsamples: usize,
    node_size: usize,
    seed: u64,
) -> Vec<Gid> {
    let n = tree.operator.size();
    let outside = n.saturating_sub(node_size);
    let want = nsamples.min(outside);
    let mut rows: Vec<Gid> = Vec::with_capacity(want);

    let mut by_distance: Vec<(f64, Gid)> = pool.iter().map(|(&g, &d)| (d, g)).collect();
    by_distance.sort_by_key(|&(d, g)| (OrderedFloat(d), g));
    for (_, gid) in by_distance {
        if rows.len() >= want {
            break;
        }
        if !own.contains(tree.morton_of_gid(gid)) && !rows.contains(&gid) {
            rows.push(gid);
        }
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut attempts = 0usize;
    while rows.len() < want && attempts < 64 * nsamples {
        attempts += 1;
        let gid = rng.gen_range(0..n);
        if !own.contains(tree.morton_of_gid(gid)) && !rows.contains(&gid) {
            rows.push(gid);
        }
    }
    rows
}
