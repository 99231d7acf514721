//! End-to-end compression driver.
//!
//! Runs the full pipeline on one rank: neighbor search, tree partition,
//! interaction lists, sample pools, skeletonization, and the conservative
//! demotion pass, with the request server up for the phases that may touch
//! remote rows. The phases are separated by explicit barriers; no
//! cross-phase overlap is assumed correct.

use crate::apply::{evaluate, RowMatrix};
use crate::error::Error;
use crate::interaction::{
    demote_uncompressed_far, find_near, merge_far, symmetrize_far, symmetrize_near,
};
use crate::kernel::{KernelOperator, KernelServer};
use crate::neighbors::all_nearest_neighbors;
use crate::runtime::{RankContext, TaskPool};
use crate::skeleton::{build_pools, skeletonize};
use crate::splitter::{CenterSplit, SplitPolicy};
use crate::tags;
use crate::tree::build::Tree;
use std::sync::Arc;
use tracing::info;

/// A compressed operator ready for matrix-vector evaluation on this rank.
pub struct CompressedOperator {
    tree: Tree,
    pool: TaskPool,
    server: Option<KernelServer>,
}

impl CompressedOperator {
    /// The underlying tree (interaction lists, skeletons, identifiers).
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Applies the compressed operator to `weights` (rows keyed by the gids
    /// this rank owns). The result is distributed the same way.
    pub fn evaluate(&mut self, weights: &RowMatrix) -> Result<RowMatrix, Error> {
        evaluate(&self.tree, &mut self.pool, weights)
    }

    /// Stops the request server and the worker pool.
    pub fn shutdown(mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

/// Compresses `operator` with the geometric-center splitter.
pub fn compress(
    ctx: &RankContext,
    config: h2mat_types::CompressionConfig,
    operator: Arc<dyn KernelOperator>,
) -> Result<CompressedOperator, Error> {
    compress_with_policy(ctx, config, operator, Arc::new(CenterSplit))
}

/// Compresses `operator`, partitioning with `policy`.
pub fn compress_with_policy(
    ctx: &RankContext,
    config: h2mat_types::CompressionConfig,
    operator: Arc<dyn KernelOperator>,
    policy: Arc<dyn SplitPolicy>,
) -> Result<CompressedOperator, Error> {
    config.validate(&ctx.topology)?;
    let mut pool = ctx.start_pool();
    let server = KernelServer::spawn(operator.clone(), ctx.comm.clone());
    match run_pipeline(ctx, config, operator, policy, &mut pool) {
        Ok(tree) => Ok(CompressedOperator {
            tree,
            pool,
            server: Some(server),
        }),
        Err(error) => {
            server.shutdown();
            Err(error)
        }
    }
}

fn run_pipeline(
    ctx: &RankContext,
    config: h2mat_types::CompressionConfig,
    operator: Arc<dyn KernelOperator>,
    policy: Arc<dyn SplitPolicy>,
    pool: &mut TaskPool,
) -> Result<Tree, Error> {
    let neighbor_table =
        all_nearest_neighbors(&config, ctx.topology, &ctx.comm, operator.clone(), pool)?;

    let tree = Tree::new(config, ctx.topology, ctx.comm.clone(), operator.clone())?;
    tree.partition(pool, policy)?;
    operator.finalize_ownership(tree.ownership_table());

    let neighbors = Arc::new(neighbor_table.redistribute(&tree, &ctx.comm));

    find_near(&tree, pool, neighbors.clone())?;
    symmetrize_near(&tree, &ctx.comm, 0)?;

    build_pools(&tree, pool, neighbors)?;

    merge_far(&tree, pool, true)?;
    symmetrize_far(&tree, &ctx.comm, 0)?;

    skeletonize(&tree, pool)?;
    demote_uncompressed_far(&tree, &ctx.comm)?;

    ctx.comm.barrier(tags::COMPRESS_DONE);
    info!(rank = ctx.comm.world_rank(), "compression complete");
    Ok(tree)
}
