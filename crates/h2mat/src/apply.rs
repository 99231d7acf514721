//! Compressed matrix-vector evaluation.
//!
//! Applies the skeletonized operator to externally supplied weight rows
//! (one row per global index, arbitrary column count) in four phases driven
//! by the same traversal substrate as construction:
//!
//! 1. **Upward**: skeleton weights. A leaf projects its own weight rows;
//!    an internal node projects the stacked skeleton weights of its
//!    children; on the distributed chain the remote half's skeleton weights
//!    arrive by pairwise exchange.
//! 2. **Exchange**: skeleton weights and leaf data referenced by Far/Near
//!    lists across rank boundaries are fetched in bulk into the proxies.
//! 3. **Lateral + downward**: each node accumulates skeleton potentials
//!    from its Far partners, then pushes them down: internal nodes split
//!    the expanded potentials between their children, leaves expand them
//!    onto their own rows.
//! 4. **Near direct**: leaf-to-leaf exact blocks for every Near pair.
//!
//! Uncompressed nodes are skipped: their far relations were demoted to
//! exact near interactions beforehand, so everything they owe is covered by
//! phase 4.

use crate::comm::Communicator;
use crate::error::Error;
use crate::morton::MortonId;
use crate::runtime::{Priority, TaskPool};
use crate::tags;
use crate::tree::build::{panics_to_error, Tree};
use crate::tree::traverse::deps;
use crate::tree::{NodeHandle, NodeKind};
use crate::Gid;
use faer::Mat;
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A dense matrix distributed one row per global index; each rank holds the
/// rows of the indices it owns.
#[derive(Clone, Debug, Default)]
pub struct RowMatrix {
    pub ncols: usize,
    pub rows: HashMap<Gid, Vec<f64>>,
}

impl RowMatrix {
    pub fn new(ncols: usize) -> Self {
        Self {
            ncols,
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, gid: Gid, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.ncols);
        self.rows.insert(gid, row);
    }

    fn gather(&self, gids: &[Gid]) -> Mat<f64> {
        Mat::from_fn(gids.len(), self.ncols, |i, j| {
            self.rows
                .get(&gids[i])
                .unwrap_or_else(|| panic!("missing weight row for gid {}", gids[i]))[j]
        })
    }

    /// Re-homes rows to the ranks owning each gid under `owner_of`.
    pub fn redistribute(
        &self,
        comm: &Communicator,
        owner_of: impl Fn(Gid) -> usize,
    ) -> RowMatrix {
        let ranks = comm.world_size();
        let mut sends: Vec<Vec<(Gid, Vec<f64>)>> = vec![Vec::new(); ranks];
        for (&gid, row) in &self.rows {
            sends[owner_of(gid)].push((gid, row.clone()));
        }
        let mut out = RowMatrix::new(self.ncols);
        for (gid, row) in comm.alltoallv(tags::ROWS_REDISTRIBUTE, sends).into_iter().flatten() {
            out.rows.insert(gid, row);
        }
        out
    }
}

/// Evaluates `K * weights` through the compressed representation.
/// `weights` must hold one row per gid this rank owns (post-partition
/// ownership); the result is distributed the same way.
pub fn evaluate(tree: &Tree, pool: &mut TaskPool, weights: &RowMatrix) -> Result<RowMatrix, Error> {
    let comm = &tree.comm;
    let ncols = weights.ncols;
    reset_eval_state(tree);

    // Stage leaf weight blocks.
    for &handle in tree.leaves() {
        let node = tree.registry.get(handle);
        let gids = node.read().gids.clone();
        let block = weights.gather(&gids);
        node.write().leaf_weights = Some(block);
    }

    upward_weights(tree, pool)?;
    comm.barrier(tags::EVAL_BARRIER);
    exchange_remote_data(tree, comm);
    far_potentials(tree, pool, ncols)?;
    downward_potentials(tree, pool)?;
    near_direct(tree, pool, ncols)?;
    comm.barrier(tags::EVAL_BARRIER.seq(1));

    // Collect leaf potentials into the distributed result.
    let mut out = RowMatrix::new(ncols);
    for &handle in tree.leaves() {
        let node = tree.registry.get(handle);
        let data = node.read();
        let potentials = data
            .leaf_potentials
            .as_ref()
            .expect("leaf potentials missing after evaluation");
        for (i, &gid) in data.gids.iter().enumerate() {
            out.rows
                .insert(gid, (0..ncols).map(|j| potentials[(i, j)]).collect());
        }
    }
    Ok(out)
}

fn reset_eval_state(tree: &Tree) {
    for handle in tree.registry.handles() {
        let node = tree.registry.get(handle);
        let mut data = node.write();
        data.weights = None;
        data.potentials = None;
        data.leaf_weights = None;
        data.leaf_potentials = None;
    }
}

/// Phase 1: skeleton weights, bottom-up.
fn upward_weights(tree: &Tree, pool: &mut TaskPool) -> Result<(), Error> {
    let visit = {
        let tree = tree.clone();
        Arc::new(move |handle: NodeHandle| {
            let node = tree.registry.get(handle);
            match &node.kind {
                NodeKind::Local { children } => {
                    if !node.read().compressed {
                        return;
                    }
                    let stacked = match children {
                        None => node.read().leaf_weights.clone().expect("leaf weights staged"),
                        Some([left, right]) => {
                            let l = tree.registry.get(*left);
                            let r = tree.registry.get(*right);
                            let l = l.read().weights.clone().expect("left skeleton weights");
                            let r = r.read().weights.clone().expect("right skeleton weights");
                            vstack(&l, &r)
                        }
                    };
                    let projected = {
                        let data = node.read();
                        let proj = data.proj.as_ref().expect("projection of compressed node");
                        proj * &stacked
                    };
                    node.write().weights = Some(projected);
                }
                NodeKind::Distributed { child, .. } => {
                    let comm = node.comm.as_ref().expect("distributed node without comm");
                    let tag = tags::EVAL_UP.at_level(node.level);
                    if !node.read().compressed {
                        return;
                    }
                    let child = tree.registry.get(*child);
                    if comm.rank() == 0 {
                        let mine = child.read().weights.clone().expect("child skeleton weights");
                        let remote: Mat<f64> = comm.recv(comm.size() / 2, tag);
                        let stacked = vstack(&mine, &remote);
                        let projected = {
                            let data = node.read();
                            let proj = data.proj.as_ref().expect("projection of compressed node");
                            proj * &stacked
                        };
                        node.write().weights = Some(projected);
                    } else if comm.rank() == comm.size() / 2 {
                        let mine = child.read().weights.clone().expect("child skeleton weights");
                        comm.send(0, tag, mine);
                    }
                }
                NodeKind::Proxy => unreachable!("proxies are not traversed"),
            }
        })
    };
    tree.traverse_local_up(
        pool,
        deps::write_self_read_children,
        Priority::Normal,
        visit.clone(),
    );
    tree.traverse_dist_up(pool, deps::write_self_read_children, Priority::High, visit);
    pool.drain().map_err(panics_to_error)
}

/// Phase 2: pull skeleton weights (Far) and leaf rows (Near) referenced
/// across rank boundaries into the local proxies.
fn exchange_remote_data(tree: &Tree, comm: &Communicator) {
    let rank = comm.world_rank();
    let ranks = comm.world_size();

    let mut far_needed: HashSet<MortonId> = HashSet::new();
    let mut near_needed: HashSet<MortonId> = HashSet::new();
    for &handle in tree.local_nodes.iter() {
        let node = tree.registry.get(handle);
        let data = node.read();
        far_needed.extend(data.far.iter().copied());
        if node.is_leaf() {
            near_needed.extend(data.near.iter().copied());
        }
    }
    for &handle in &tree.chain {
        let node = tree.registry.get(handle);
        if node.comm.as_ref().map_or(true, |c| c.rank() == 0) {
            far_needed.extend(node.read().far.iter().copied());
        }
    }

    let mut requests: Vec<Vec<(MortonId, bool)>> = vec![Vec::new(); ranks];
    for m in far_needed {
        let owner = tree.owner_rank(m);
        if owner != rank {
            requests[owner].push((m, true));
        }
    }
    for m in near_needed {
        let owner = tree.owner_rank(m);
        if owner != rank {
            requests[owner].push((m, false));
        }
    }

    let incoming = comm.alltoallv(tags::LET_REQUEST, requests);
    let replies: Vec<Vec<LetReply>> = incoming
        .into_iter()
        .map(|asks| {
            asks.into_iter()
                .map(|(m, is_far)| {
                    let node = tree
                        .registry
                        .get(tree.registry.lookup(m).expect("request for an unowned node"));
                    let data = node.read();
                    if is_far {
                        assert!(data.compressed, "far relation to an uncompressed node");
                        LetReply::Skeletons {
                            morton: m,
                            skeletons: data.skeletons.clone(),
                            weights: data.weights.clone().expect("skeleton weights staged"),
                        }
                    } else {
                        LetReply::LeafRows {
                            morton: m,
                            gids: data.gids.clone(),
                            weights: data.leaf_weights.clone().expect("leaf weights staged"),
                        }
                    }
                })
                .collect()
        })
        .collect();

    let answers = comm.alltoallv(tags::LET_REPLY, replies);
    let mut filled = 0usize;
    for reply in answers.into_iter().flatten() {
        match reply {
            LetReply::Skeletons {
                morton,
                skeletons,
                weights,
            } => {
                let node = tree.registry.get(tree.registry.proxy(morton));
                let mut data = node.write();
                data.skeletons = skeletons;
                data.weights = Some(weights);
                data.compressed = true;
            }
            LetReply::LeafRows {
                morton,
                gids,
                weights,
            } => {
                let node = tree.registry.get(tree.registry.proxy(morton));
                let mut data = node.write();
                data.gids = gids;
                data.leaf_weights = Some(weights);
            }
        }
        filled += 1;
    }
    debug!(rank, filled, "filled remote proxies");
}

enum LetReply {
    Skeletons {
        morton: MortonId,
        skeletons: Vec<Gid>,
        weights: Mat<f64>,
    },
    LeafRows {
        morton: MortonId,
        gids: Vec<Gid>,
        weights: Mat<f64>,
    },
}

/// Phase 3a: skeleton potentials from Far partners.
fn far_potentials(tree: &Tree, pool: &mut TaskPool, ncols: usize) -> Result<(), Error> {
    let visit = {
        let tree = tree.clone();
        Arc::new(move |handle: NodeHandle| {
            let node = tree.registry.get(handle);
            // Chain replicas evaluate only where their data lives.
            if let Some(node_comm) = node.comm.as_ref() {
                if node_comm.rank() != 0 {
                    return;
                }
            }
            let (compressed, skeletons, far) = {
                let data = node.read();
                (data.compressed, data.skeletons.clone(), data.far.clone())
            };
            if !compressed {
                return;
            }
            let mut acc = Mat::<f64>::zeros(skeletons.len(), ncols);
            for m in far {
                let partner = tree
                    .registry
                    .get(tree.registry.lookup(m).expect("far partner not materialized"));
                let partner = partner.read();
                let block = tree.operator.block(&skeletons, &partner.skeletons);
                let w = partner.weights.as_ref().expect("far partner weights");
                mat_add_assign(&mut acc, &(&block * w));
            }
            node.write().potentials = Some(acc);
        })
    };
    tree.traverse_local_unordered(pool, deps::write_self, Priority::Normal, visit.clone());
    tree.traverse_dist_unordered(pool, deps::write_self, Priority::High, visit);
    pool.drain().map_err(panics_to_error)
}

/// Phase 3b: push skeleton potentials down to the leaves.
fn downward_potentials(tree: &Tree, pool: &mut TaskPool) -> Result<(), Error> {
    let visit = {
        let tree = tree.clone();
        Arc::new(move |handle: NodeHandle| {
            let node = tree.registry.get(handle);
            match &node.kind {
                NodeKind::Local { children } => {
                    let (compressed, potentials) = {
                        let data = node.read();
                        (data.compressed, data.potentials.clone())
                    };
                    if !compressed {
                        return;
                    }
                    let Some(potentials) = potentials else {
                        return;
                    };
                    let expanded = {
                        let data = node.read();
                        let proj = data.proj.as_ref().expect("projection of compressed node");
                        proj.transpose() * potentials.as_ref()
                    };
                    match children {
                        None => {
                            let mut data = node.write();
                            accumulate(&mut data.leaf_potentials, &expanded);
                        }
                        Some([left, right]) => {
                            let l = tree.registry.get(*left);
                            let r = tree.registry.get(*right);
                            let split = l.read().skeletons.len();
                            add_rows(&l, &expanded, 0, split);
                            add_rows(&r, &expanded, split, expanded.nrows() - split);
                        }
                    }
                }
                NodeKind::Distributed { child, .. } => {
                    let comm = node.comm.as_ref().expect("distributed node without comm");
                    let tag = tags::EVAL_DOWN.at_level(node.level);
                    let compressed = node.read().compressed;
                    if !compressed {
                        return;
                    }
                    let child = tree.registry.get(*child);
                    if comm.rank() == 0 {
                        let (expanded, split) = {
                            let data = node.read();
                            let Some(potentials) = data.potentials.as_ref() else {
                                comm.send(comm.size() / 2, tag, None::<Mat<f64>>);
                                return;
                            };
                            let proj = data.proj.as_ref().expect("projection of compressed node");
                            (proj.transpose() * potentials.as_ref(), child.read().skeletons.len())
                        };
                        let sibling_part = submatrix(&expanded, split, expanded.nrows() - split);
                        comm.send(comm.size() / 2, tag, Some(sibling_part));
                        add_rows(&child, &expanded, 0, split);
                    } else if comm.rank() == comm.size() / 2 {
                        if let Some(share) = comm.recv::<Option<Mat<f64>>>(0, tag) {
                            let mut data = child.write();
                            accumulate(&mut data.potentials, &share);
                        }
                    }
                }
                NodeKind::Proxy => unreachable!("proxies are not traversed"),
            }
        })
    };
    tree.traverse_dist_down(pool, deps::write_self_write_children, Priority::High, visit.clone());
    tree.traverse_local_down(pool, deps::write_self_write_children, Priority::Normal, visit);
    pool.drain().map_err(panics_to_error)
}

/// Phase 4: exact leaf-to-leaf near blocks.
fn near_direct(tree: &Tree, pool: &mut TaskPool, ncols: usize) -> Result<(), Error> {
    let visit = {
        let tree = tree.clone();
        Arc::new(move |handle: NodeHandle| {
            let node = tree.registry.get(handle);
            let (gids, near) = {
                let data = node.read();
                (data.gids.clone(), data.near.clone())
            };
            let mut acc = Mat::<f64>::zeros(gids.len(), ncols);
            for m in near {
                let partner = tree
                    .registry
                    .get(tree.registry.lookup(m).expect("near partner not materialized"));
                let partner = partner.read();
                let block = tree.operator.block(&gids, &partner.gids);
                let w = partner
                    .leaf_weights
                    .as_ref()
                    .expect("near partner leaf weights");
                mat_add_assign(&mut acc, &(&block * w));
            }
            let mut data = node.write();
            accumulate(&mut data.leaf_potentials, &acc);
        })
    };
    tree.traverse_local_leaves(pool, deps::write_self, Priority::Normal, visit);
    pool.drain().map_err(panics_to_error)
}

fn vstack(top: &Mat<f64>, bottom: &Mat<f64>) -> Mat<f64> {
    debug_assert_eq!(top.ncols(), bottom.ncols());
    Mat::from_fn(top.nrows() + bottom.nrows(), top.ncols(), |i, j| {
        if i < top.nrows() {
            top[(i, j)]
        } else {
            bottom[(i - top.nrows(), j)]
        }
    })
}

fn submatrix(m: &Mat<f64>, first_row: usize, nrows: usize) -> Mat<f64> {
    Mat::from_fn(nrows, m.ncols(), |i, j| m[(first_row + i, j)])
}

fn add_rows(node: &Arc<crate::tree::Node>, expanded: &Mat<f64>, first_row: usize, nrows: usize) {
    let share = submatrix(expanded, first_row, nrows);
    let mut data = node.write();
    accumulate(&mut data.potentials, &share);
}

fn accumulate(slot: &mut Option<Mat<f64>>, share: &Mat<f64>) {
    match slot {
        Some(existing) => mat_add_assign(existing, share),
        None => *slot = Some(share.clone()),
    }
}

fn mat_add_assign(dst: &mut Mat<f64>, src: &Mat<f64>) {
    debug_assert_eq!((dst.nrows(), dst.ncols()), (src.nrows(), src.ncols()));
    for j in 0..dst.ncols() {
        for i in 0..dst.nrows() {
            dst[(i, j)] += src[(i, j)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vstack_preserves_row_blocks() {
        let top = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f64);
        let bottom = Mat::from_fn(1, 3, |_, j| 100.0 + j as f64);
        let stacked = vstack(&top, &bottom);
        assert_eq!(stacked.nrows(), 3);
        assert_eq!(stacked[(1, 2)], 5.0);
        assert_eq!(stacked[(2, 0)], 100.0);
    }

    #[test]
    fn submatrix_extracts_a_row_range() {
        let m = Mat::from_fn(4, 2, |i, j| (i * 2 + j) as f64);
        let mid = submatrix(&m, 1, 2);
        assert_eq!(mid.nrows(), 2);
        assert_eq!(mid[(0, 0)], 2.0);
        assert_eq!(mid[(1, 1)], 5.0);
    }

    #[test]
    fn accumulate_initializes_then_adds() {
        let mut slot = None;
        let share = Mat::from_fn(2, 2, |i, j| (i + j) as f64);
        accumulate(&mut slot, &share);
        accumulate(&mut slot, &share);
        let total = slot.unwrap();
        assert_eq!(total[(1, 1)], 4.0);
    }
}
