//! Approximate all-nearest-neighbor search.
//!
//! Runs a configured number of randomized partition passes: each pass
//! builds a scratch tree with the random splitter, searches every leaf
//! exhaustively, and folds the per-leaf candidates into a global table that
//! keeps the `k` closest distinct neighbors per index. Neighbor rows are
//! kept round-robin (`gid mod P`) between passes, matching the initial
//! index distribution of the next pass.
//!
//! The resulting lists seed the Near interaction lists and the per-node
//! sample pools.

use crate::comm::Communicator;
use crate::error::Error;
use crate::kernel::KernelOperator;
use crate::runtime::{Priority, TaskPool};
use crate::splitter::RandomSplit;
use crate::tags;
use crate::tree::build::{panics_to_error, Tree};
use crate::tree::traverse::deps;
use crate::Gid;
use h2mat_types::{CompressionConfig, DistanceMetric, Topology};
use hashbrown::HashMap;
use ordered_float::OrderedFloat;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Per-index neighbor lists, distributed round-robin across ranks.
pub struct NeighborTable {
    k: usize,
    /// `gid → [(distance, neighbor gid)]`, ascending by distance, for gids
    /// with `gid % P == rank`.
    owned: HashMap<Gid, Vec<(f64, Gid)>>,
}

impl NeighborTable {
    fn new(k: usize) -> Self {
        Self {
            k,
            owned: HashMap::new(),
        }
    }

    /// Neighbors of a round-robin-owned gid.
    pub fn neighbors_of(&self, gid: Gid) -> &[(f64, Gid)] {
        self.owned.get(&gid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Folds freshly found `(gid, candidates)` pairs into the table,
    /// routing each gid's candidates to its round-robin owner.
    fn merge(
        &mut self,
        found: Vec<(Gid, Vec<(f64, Gid)>)>,
        comm: &Communicator,
        pass: u64,
    ) {
        let ranks = comm.world_size();
        let mut sends: Vec<Vec<(Gid, Vec<(f64, Gid)>)>> = vec![Vec::new(); ranks];
        for (gid, candidates) in found {
            sends[gid % ranks].push((gid, candidates));
        }
        let received = comm.alltoallv(tags::NEIGHBOR_MERGE.seq(pass), sends);
        for (gid, candidates) in received.into_iter().flatten() {
            let entry = self.owned.entry(gid).or_default();
            entry.extend(candidates);
            // Keep the closest copy of each distinct neighbor, then the k
            // closest neighbors overall.
            entry.sort_by_key(|&(d, g)| (g, OrderedFloat(d)));
            entry.dedup_by_key(|&mut (_, g)| g);
            entry.sort_by_key(|&(d, g)| (OrderedFloat(d), g));
            entry.truncate(self.k);
        }
    }

    /// Re-homes the lists from round-robin owners to the ranks owning each
    /// gid in the partitioned tree, keyed for leaf consumption.
    pub fn redistribute(
        &self,
        tree: &Tree,
        comm: &Communicator,
    ) -> HashMap<Gid, Vec<(f64, Gid)>> {
        let ranks = comm.world_size();
        let mut sends: Vec<Vec<(Gid, Vec<(f64, Gid)>)>> = vec![Vec::new(); ranks];
        for (&gid, list) in &self.owned {
            sends[tree.owner_of_gid(gid)].push((gid, list.clone()));
        }
        comm.alltoallv(tags::NEIGHBOR_REDISTRIBUTE, sends)
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Exhaustive `k`-nearest-neighbor search within one leaf's index set.
fn leaf_neighbors(
    operator: &dyn KernelOperator,
    metric: DistanceMetric,
    gids: &[Gid],
    k: usize,
) -> Vec<(Gid, Vec<(f64, Gid)>)> {
    let len = gids.len();
    if len < 2 {
        return Vec::new();
    }
    let distances = pairwise_distances(operator, metric, gids);
    gids.iter()
        .enumerate()
        .map(|(i, &gid)| {
            let mut list: Vec<(f64, Gid)> = (0..len)
                .filter(|&j| j != i)
                .map(|j| (distances[(i, j)], gids[j]))
                .collect();
            list.sort_by_key(|&(d, g)| (OrderedFloat(d), g));
            list.truncate(k);
            (gid, list)
        })
        .collect()
}

/// All pairwise distances within `gids` under `metric`. Rows of `gids` are
/// locally held (they are one leaf's index set).
pub(crate) fn pairwise_distances(
    operator: &dyn KernelOperator,
    metric: DistanceMetric,
    gids: &[Gid],
) -> faer::Mat<f64> {
    let len = gids.len();
    match metric {
        DistanceMetric::Geometric => {
            let points = operator
                .geometry()
                .expect("geometric metric requires operator geometry");
            faer::Mat::from_fn(len, len, |i, j| points.dist2(gids[i], gids[j]))
        }
        DistanceMetric::Kernel => {
            let block = operator.block(gids, gids);
            faer::Mat::from_fn(len, len, |i, j| {
                block[(i, i)] + block[(j, j)] - 2.0 * block[(i, j)]
            })
        }
        DistanceMetric::Angular => {
            let block = operator.block(gids, gids);
            faer::Mat::from_fn(len, len, |i, j| {
                1.0 - block[(i, j)] * block[(i, j)] / (block[(i, i)] * block[(j, j)])
            })
        }
    }
}

/// Runs the configured number of randomized passes and returns the table.
pub fn all_nearest_neighbors(
    config: &CompressionConfig,
    topology: Topology,
    comm: &Communicator,
    operator: Arc<dyn KernelOperator>,
    pool: &mut TaskPool,
) -> Result<NeighborTable, Error> {
    let mut table = NeighborTable::new(config.neighbors);
    if config.neighbors == 0 || config.neighbor_trees == 0 {
        return Ok(table);
    }
    info!(passes = config.neighbor_trees, k = config.neighbors, "neighbor search");

    for pass in 0..config.neighbor_trees {
        // Scratch partition with larger leaves: each leaf must see enough
        // points for an exhaustive k-neighborhood to mean something.
        let mut scratch = config.clone();
        scratch.leaf_size = (4 * config.neighbors)
            .max(config.leaf_size)
            .min(config.problem_size / topology.ranks());
        scratch.seed = config
            .seed
            .wrapping_add(0xa5a5_0000)
            .wrapping_add(pass as u64);

        let tree = Tree::new(scratch, topology, comm.clone(), operator.clone())?;
        tree.partition(pool, Arc::new(RandomSplit))?;

        let found = Arc::new(Mutex::new(Vec::new()));
        {
            let tree = tree.clone();
            let found = found.clone();
            let metric = config.metric;
            let k = config.neighbors;
            tree.clone().traverse_local_leaves(
                pool,
                deps::write_self,
                Priority::Normal,
                Arc::new(move |handle| {
                    let node = tree.registry.get(handle);
                    let gids = node.read().gids.clone();
                    let lists = leaf_neighbors(tree.operator.as_ref(), metric, &gids, k);
                    found.lock().unwrap().extend(lists);
                }),
            );
        }
        pool.drain().map_err(panics_to_error)?;
        comm.barrier(tags::NEIGHBOR_BARRIER.seq(pass as u64));

        let found = std::mem::take(&mut *found.lock().unwrap());
        table.merge(found, comm, pass as u64);

        // Rows moved with the scratch partition; the next pass (and the
        // compression partition after it) starts round-robin again.
        operator.reset_distribution(comm);
    }
    Ok(table)
}
