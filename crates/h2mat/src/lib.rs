//! Hierarchical low-rank compression of kernel matrices.
//!
//! `h2mat` compresses a large symmetric kernel-induced matrix into a
//! hierarchical low-rank representation and applies it to vectors at
//! near-linear cost, scaling across both the worker threads of one rank and
//! a message-passing group of ranks.
//!
//! The pipeline, in phase order:
//!
//! 1. A binary spatial/metric tree is partitioned over `N` indices spanning
//!    `P` ranks ([`tree`], [`splitter`]), assigning each node a canonical
//!    hierarchical identifier ([`morton`]).
//! 2. Approximate neighbor lists ([`neighbors`]) seed per-node Near/Far
//!    interaction lists, which are symmetrized across ranks
//!    ([`interaction`]).
//! 3. Each node's operator block is skeletonized through a rank-revealing
//!    interpolative decomposition over sampled sub-blocks ([`skeleton`],
//!    [`linalg`]).
//! 4. Matrix-vector products run through the skeleton factors, evaluating
//!    Near pairs exactly and Far pairs in the compressed basis ([`apply`]).
//!
//! Every phase executes as a DAG of per-node tasks over a dependency-tracked
//! worker pool ([`runtime`]), with rank boundaries crossed only through
//! message passing ([`comm`]). The operator itself is consumed through the
//! narrow [`kernel::KernelOperator`] interface.
//!
//! ```
//! use h2mat::kernel::{GaussianKernel, PointSet};
//! use h2mat::runtime::Runtime;
//! use h2mat::{CompressionConfig, Topology};
//! use std::sync::Arc;
//!
//! let topology = Topology::new(2, 2).unwrap();
//! let config = CompressionConfig::new(256, 32);
//! let results = Runtime::launch(topology, move |ctx| {
//!     let points = PointSet::new(1, (0..256).map(|i| i as f64).collect());
//!     let operator = Arc::new(GaussianKernel::new(points, 16.0));
//!     let compressed = h2mat::compress(&ctx, config.clone(), operator).unwrap();
//!     let depth = compressed.tree().total_depth;
//!     compressed.shutdown();
//!     depth
//! })
//! .unwrap();
//! assert_eq!(results, vec![3, 3]);
//! ```

pub mod apply;
pub mod comm;
pub mod error;
pub mod interaction;
pub mod kernel;
pub mod linalg;
pub mod morton;
pub mod neighbors;
pub mod runtime;
pub mod skeleton;
pub mod splitter;
pub mod tree;

mod engine;

#[cfg(test)]
mod pipeline_tests;

pub use apply::RowMatrix;
pub use engine::{compress, compress_with_policy, CompressedOperator};
pub use error::Error;
pub use h2mat_types::{CompressionConfig, ConfigError, DistanceMetric, Topology};
pub use morton::MortonId;
pub use tree::build::Tree;

/// Opaque identifier of one of the `N` original points/rows. Globally
/// unique and immutable for the lifetime of a run.
pub type Gid = usize;

/// Message-tag table: one protocol point per constant. See
/// [`comm::Tag`] for the layout.
pub(crate) mod tags {
    use crate::comm::Tag;

    pub const SPLIT: Tag = Tag::new(1);
    pub const SPLIT_COUNT: Tag = Tag::new(2);
    pub const SPLIT_EXCHANGE: Tag = Tag::new(3);
    pub const SPLIT_DONE: Tag = Tag::new(4);
    pub const PHASE_BARRIER: Tag = Tag::new(5);
    pub const MORTON_GATHER: Tag = Tag::new(6);

    pub const NEIGHBOR_MERGE: Tag = Tag::new(10);
    pub const NEIGHBOR_REDISTRIBUTE: Tag = Tag::new(11);
    pub const NEIGHBOR_BARRIER: Tag = Tag::new(12);

    pub const NEAR_SYMMETRIZE: Tag = Tag::new(20);
    pub const FAR_MERGE: Tag = Tag::new(21);
    pub const FAR_SYMMETRIZE: Tag = Tag::new(22);
    pub const FAR_REPLICATE: Tag = Tag::new(23);
    pub const DEMOTE_GATHER: Tag = Tag::new(24);

    pub const POOL_MERGE: Tag = Tag::new(30);
    pub const SKELETONIZE: Tag = Tag::new(31);

    pub const KERNEL_REQUEST: Tag = Tag::new(40);
    pub const KERNEL_REPLY: Tag = Tag::new(41);
    pub const KERNEL_REDISTRIBUTE: Tag = Tag::new(42);
    pub const KERNEL_RESET: Tag = Tag::new(43);

    pub const EVAL_UP: Tag = Tag::new(50);
    pub const EVAL_DOWN: Tag = Tag::new(51);
    pub const EVAL_BARRIER: Tag = Tag::new(52);
    pub const LET_REQUEST: Tag = Tag::new(53);
    pub const LET_REPLY: Tag = Tag::new(54);
    pub const ROWS_REDISTRIBUTE: Tag = Tag::new(55);

    pub const COMPRESS_DONE: Tag = Tag::new(60);
    pub const CHECK_REDUCE: Tag = Tag::new(61);
}
