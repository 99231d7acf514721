//! End-to-end pipeline tests: full compression runs over small problems,
//! checked against the structural guarantees of the tree, the interaction
//! lists, and the dense reference product.

use crate::apply::RowMatrix;
use crate::interaction::check_interactions;
use crate::kernel::{DenseKernel, GaussianKernel, KernelOperator, PointSet, RowPartitionedKernel};
use crate::morton::MortonId;
use crate::runtime::Runtime;
use crate::{compress, Gid};
use faer::Mat;
use h2mat_types::{CompressionConfig, DistanceMetric, Topology};
use hashbrown::HashMap;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Two well-separated Gaussian blobs in the plane, interleaved so the
/// round-robin initial distribution mixes them.
fn two_cluster_points(n: usize, seed: u64) -> PointSet {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut coords = Vec::with_capacity(2 * n);
    for i in 0..n {
        let center = if i % 2 == 0 { -100.0 } else { 100.0 };
        coords.push(center + rng.gen_range(-1.0..1.0));
        coords.push(center + rng.gen_range(-1.0..1.0));
    }
    PointSet::new(2, coords)
}

fn line_kernel(n: usize, bandwidth: f64) -> GaussianKernel {
    let points = PointSet::new(1, (0..n).map(|i| i as f64).collect());
    GaussianKernel::new(points, bandwidth)
}

fn geometric_config(n: usize, leaf: usize) -> CompressionConfig {
    let mut config = CompressionConfig::new(n, leaf);
    config.metric = DistanceMetric::Geometric;
    config.neighbors = 8;
    config.neighbor_trees = 2;
    config.max_rank = 64;
    config.tolerance = 1e-6;
    config.budget = 0.25;
    config.seed = 17;
    config
}

fn dense_reference(kernel: &dyn KernelOperator, weights: &[f64]) -> Vec<f64> {
    let n = kernel.size();
    (0..n)
        .map(|i| (0..n).map(|j| kernel.entry(i, j) * weights[j]).sum())
        .collect()
}

#[test]
fn partition_is_complete_and_balanced() {
    init_tracing();
    let n = 1000;
    let topology = Topology::new(4, 2).unwrap();
    let per_rank = Runtime::launch(topology, move |ctx| {
        let points = PointSet::new(1, (0..n).map(|i| (i as f64).sqrt()).collect());
        let operator = Arc::new(GaussianKernel::new(points, 4.0));
        let compressed = compress(&ctx, geometric_config(n, 32), operator).unwrap();
        let tree = compressed.tree();
        let leaves: Vec<Vec<Gid>> = tree
            .leaves()
            .iter()
            .map(|&h| tree.registry.get(h).read().gids.clone())
            .collect();
        compressed.shutdown();
        leaves
    })
    .unwrap();

    let mut seen = vec![0usize; n];
    let mut sizes = Vec::new();
    for leaves in per_rank {
        for gids in leaves {
            sizes.push(gids.len());
            for gid in gids {
                seen[gid] += 1;
            }
        }
    }
    // Union of all leaf index sets is {0..N}, each exactly once.
    assert!(seen.iter().all(|&c| c == 1));
    // Exact median splits keep every leaf within one point of its peers.
    let min = sizes.iter().min().unwrap();
    let max = sizes.iter().max().unwrap();
    assert!(max - min <= 1, "leaf sizes range from {min} to {max}");
}

#[test]
fn near_lists_are_symmetric_and_disjoint_from_far() {
    let n = 512;
    let topology = Topology::new(2, 2).unwrap();
    let all: Vec<(usize, Vec<(MortonId, BTreeSet<MortonId>, BTreeSet<MortonId>)>)> =
        Runtime::launch(topology, move |ctx| {
            let operator = Arc::new(line_kernel(n, 8.0));
            let compressed = compress(&ctx, geometric_config(n, 32), operator).unwrap();
            let tree = compressed.tree();
            let lists: Vec<(MortonId, BTreeSet<MortonId>, BTreeSet<MortonId>)> = tree
                .leaves()
                .iter()
                .map(|&h| {
                    let node = tree.registry.get(h);
                    let data = node.read();
                    (node.morton(), data.near.clone(), data.far.clone())
                })
                .collect();
            compressed.shutdown();
            (ctx.comm.world_rank(), lists)
        })
        .unwrap();

    let mut near_of: HashMap<MortonId, BTreeSet<MortonId>> = HashMap::new();
    for (_, lists) in &all {
        for (morton, near, far) in lists {
            assert!(near.intersection(far).next().is_none(), "near/far overlap");
            near_of.insert(*morton, near.clone());
        }
    }
    for (a, near) in &near_of {
        for b in near {
            assert!(
                near_of[b].contains(a),
                "{a:?} lists {b:?} as near but not vice versa"
            );
        }
    }
}

#[test]
fn interaction_lists_cover_every_leaf_pair_once() {
    let n = 512;
    let topology = Topology::new(4, 2).unwrap();
    let tables = Runtime::launch(topology, move |ctx| {
        let operator = Arc::new(line_kernel(n, 8.0));
        let compressed = compress(&ctx, geometric_config(n, 32), operator).unwrap();
        let table = check_interactions(compressed.tree(), &ctx.comm);
        compressed.shutdown();
        table
    })
    .unwrap();

    let table = tables.into_iter().flatten().next().expect("rank 0 table");
    for (i, row) in table.iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            assert_eq!(count, 1, "leaf pair ({i}, {j}) covered {count} times");
        }
    }
}

#[test]
fn fixed_seed_runs_are_identical() {
    let n = 768;
    let run = || {
        let topology = Topology::new(4, 2).unwrap();
        Runtime::launch(topology, move |ctx| {
            let operator = Arc::new(line_kernel(n, 8.0));
            let compressed = compress(&ctx, geometric_config(n, 32), operator).unwrap();
            let tree = compressed.tree();
            let mortons: Vec<MortonId> = (0..n).map(|g| tree.morton_of_gid(g)).collect();
            let skeletons: Vec<(MortonId, Vec<Gid>)> = tree
                .local_nodes
                .iter()
                .map(|&h| {
                    let node = tree.registry.get(h);
                    let entry = (node.morton(), node.read().skeletons.clone());
                    entry
                })
                .collect();
            let leaves: Vec<Vec<Gid>> = tree
                .leaves()
                .iter()
                .map(|&h| tree.registry.get(h).read().gids.clone())
                .collect();
            compressed.shutdown();
            (mortons, skeletons, leaves)
        })
        .unwrap()
    };
    let first = run();
    let second = run();
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.0, b.0, "gid identifiers differ between runs");
        assert_eq!(a.2, b.2, "partitions differ between runs");
        assert_eq!(a.1, b.1, "skeleton sets differ between runs");
    }
}

/// Scenario A: two well-separated clusters, four ranks, geometric metric.
/// The tree has two distributed plus two local levels, each cluster lands in
/// one half of the tree, and the second-level Far lists are exactly the
/// opposite cluster's node.
#[test]
fn two_separated_clusters_prune_each_other_wholesale() {
    let n = 1024;
    let topology = Topology::new(4, 2).unwrap();
    let results = Runtime::launch(topology, move |ctx| {
        let points = two_cluster_points(n, 5);
        let cluster_of: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
        let operator = Arc::new(GaussianKernel::new(points, 10.0));
        let compressed = compress(&ctx, geometric_config(n, 64), operator).unwrap();
        let tree = compressed.tree();

        assert_eq!(tree.total_depth, 4);
        assert_eq!(tree.topology.levels(), 2);
        assert_eq!(tree.local_depth, 2);

        // Which clusters this rank's points belong to.
        let mut owned_clusters = BTreeSet::new();
        for &leaf in tree.leaves() {
            for &gid in &tree.registry.get(leaf).read().gids {
                owned_clusters.insert(cluster_of[gid]);
            }
        }

        // The level-1 distributed node's far list.
        let level1 = tree.chain[1];
        let node = tree.registry.get(level1);
        let own = node.morton();
        let far = node.read().far.clone();
        compressed.shutdown();
        (ctx.comm.world_rank(), owned_clusters, own, far)
    })
    .unwrap();

    for (rank, clusters, own, far) in &results {
        // Each rank holds points of exactly one cluster.
        assert_eq!(clusters.len(), 1, "rank {rank} mixes clusters");
        // The level-1 far list is exactly the opposite half of the tree.
        assert_eq!(own.level(), 1);
        let expected: BTreeSet<MortonId> = [own.sibling()].into_iter().collect();
        assert_eq!(far, &expected, "rank {rank} level-1 far list");
    }
    // Ranks sharing a tree half share a cluster; the halves differ.
    assert_eq!(results[0].1, results[1].1);
    assert_eq!(results[2].1, results[3].1);
    assert_ne!(results[0].1, results[2].1);
}

/// Scenario B: explicit dense SPD kernel, random right-hand side; the
/// compressed product stays within the configured relative tolerance of the
/// exact dense product.
#[test]
fn compressed_matvec_matches_dense_product() {
    init_tracing();
    let n = 256;
    let topology = Topology::new(1, 2).unwrap();
    let mut config = CompressionConfig::new(n, 32);
    config.metric = DistanceMetric::Kernel;
    config.neighbors = 8;
    config.neighbor_trees = 2;
    config.max_rank = 48;
    config.tolerance = 1e-2;
    config.budget = 0.2;
    config.seed = 23;

    let errors = Runtime::launch(topology, move |ctx| {
        // A smooth SPD kernel matrix, stated explicitly.
        let dense = Mat::from_fn(n, n, |i, j| {
            let d = i as f64 - j as f64;
            (-d * d / 512.0).exp()
        });
        let operator = Arc::new(DenseKernel::new(dense));
        let reference_op = operator.clone();

        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let weights_vec: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut compressed = compress(&ctx, config.clone(), operator).unwrap();
        let mut weights = RowMatrix::new(1);
        for (gid, &w) in weights_vec.iter().enumerate() {
            weights.insert(gid, vec![w]);
        }
        let result = compressed.evaluate(&weights).unwrap();
        compressed.shutdown();

        let exact = dense_reference(reference_op.as_ref(), &weights_vec);
        let mut err2 = 0.0;
        let mut norm2 = 0.0;
        for (gid, &x) in exact.iter().enumerate() {
            let got = result.rows[&gid][0];
            err2 += (got - x) * (got - x);
            norm2 += x * x;
        }
        (err2.sqrt(), norm2.sqrt())
    })
    .unwrap();

    let (err, norm) = errors[0];
    assert!(
        err < 1e-2 * norm,
        "relative error {} exceeds tolerance",
        err / norm
    );
}

/// The distributed evaluation path agrees with the dense product too.
#[test]
fn distributed_matvec_matches_dense_product() {
    let n = 128;
    let topology = Topology::new(2, 3).unwrap();
    let mut config = geometric_config(n, 16);
    config.tolerance = 1e-8;
    config.max_rank = 32;

    let partials = Runtime::launch(topology, move |ctx| {
        let operator = Arc::new(line_kernel(n, 6.0));
        let reference_op = operator.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let weights_vec: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut compressed = compress(&ctx, config.clone(), operator).unwrap();
        let tree = compressed.tree().clone();

        // Weight rows start round-robin and are re-homed to the ranks that
        // own them after partitioning.
        let mut initial = RowMatrix::new(1);
        for gid in (ctx.comm.world_rank()..n).step_by(ctx.comm.world_size()) {
            initial.insert(gid, vec![weights_vec[gid]]);
        }
        let weights = initial.redistribute(&ctx.comm, |gid| tree.owner_of_gid(gid));
        let result = compressed.evaluate(&weights).unwrap();
        compressed.shutdown();

        let exact = dense_reference(reference_op.as_ref(), &weights_vec);
        result
            .rows
            .iter()
            .map(|(&gid, row)| (gid, row[0], exact[gid]))
            .collect::<Vec<_>>()
    })
    .unwrap();

    let mut seen = vec![false; n];
    let mut err2 = 0.0;
    let mut norm2 = 0.0;
    for (gid, got, exact) in partials.into_iter().flatten() {
        assert!(!seen[gid], "gid {gid} produced on two ranks");
        seen[gid] = true;
        err2 += (got - exact) * (got - exact);
        norm2 += exact * exact;
    }
    assert!(seen.iter().all(|&s| s), "missing output rows");
    assert!(
        err2.sqrt() < 1e-3 * norm2.sqrt(),
        "relative error {}",
        err2.sqrt() / norm2.sqrt()
    );
}

/// The row-partitioned operator adapter (rows follow tree ownership, remote
/// blocks served by the reserved worker) produces the same result as the
/// replicated operator.
#[test]
fn row_partitioned_operator_matches_replicated() {
    let n = 128;
    let topology = Topology::new(2, 3).unwrap();
    let mut config = geometric_config(n, 16);
    config.metric = DistanceMetric::Kernel;

    let partials = Runtime::launch(topology, move |ctx| {
        let reference = line_kernel(n, 6.0);
        let owned: Vec<Gid> = (ctx.comm.world_rank()..n)
            .step_by(ctx.comm.world_size())
            .collect();
        let operator = Arc::new(RowPartitionedKernel::new(
            n,
            &owned,
            ctx.comm.clone(),
            |gid| (0..n).map(|j| reference.entry(gid, j)).collect(),
        ));

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let weights_vec: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut compressed = compress(&ctx, config.clone(), operator).unwrap();
        let tree = compressed.tree().clone();
        let mut weights = RowMatrix::new(1);
        for gid in 0..n {
            if tree.owner_of_gid(gid) == ctx.comm.world_rank() {
                weights.insert(gid, vec![weights_vec[gid]]);
            }
        }
        let result = compressed.evaluate(&weights).unwrap();
        compressed.shutdown();

        let exact = dense_reference(&reference, &weights_vec);
        result
            .rows
            .iter()
            .map(|(&gid, row)| (gid, row[0], exact[gid]))
            .collect::<Vec<_>>()
    })
    .unwrap();

    let mut err2 = 0.0;
    let mut norm2 = 0.0;
    let mut rows = 0;
    for (_, got, exact) in partials.into_iter().flatten() {
        err2 += (got - exact) * (got - exact);
        norm2 += exact * exact;
        rows += 1;
    }
    assert_eq!(rows, n);
    assert!(err2.sqrt() < 1e-3 * norm2.sqrt());
}

/// Far merge identity (checked without the symmetric tie-break): after the
/// bottom-up merge, the parent's far list is exactly what both children
/// shared, and the children keep only what the parent does not cover.
#[test]
fn far_merge_moves_shared_relations_to_the_parent() {
    use crate::interaction::{find_near, merge_far, symmetrize_near};
    use crate::splitter::CenterSplit;
    use crate::tree::build::Tree;

    let n = 256;
    let topology = Topology::new(1, 2).unwrap();
    Runtime::launch(topology, move |ctx| {
        let operator: Arc<dyn KernelOperator> = Arc::new(line_kernel(n, 8.0));
        let config = geometric_config(n, 16);
        let mut pool = ctx.start_pool();

        let neighbors = crate::neighbors::all_nearest_neighbors(
            &config,
            ctx.topology,
            &ctx.comm,
            operator.clone(),
            &mut pool,
        )
        .unwrap();
        let tree = Tree::new(config, ctx.topology, ctx.comm.clone(), operator).unwrap();
        tree.partition(&mut pool, Arc::new(CenterSplit)).unwrap();
        let neighbors = Arc::new(neighbors.redistribute(&tree, &ctx.comm));
        find_near(&tree, &mut pool, neighbors).unwrap();
        symmetrize_near(&tree, &ctx.comm, 0).unwrap();
        merge_far(&tree, &mut pool, false).unwrap();

        for &handle in tree.local_nodes.iter() {
            let node = tree.registry.get(handle);
            let Some([left, right]) = node.children() else {
                continue;
            };
            let parent_far = node.read().far.clone();
            let left_far = tree.registry.get(left).read().far.clone();
            let right_far = tree.registry.get(right).read().far.clone();

            // Children no longer share anything: the parent took it.
            assert!(left_far.intersection(&right_far).next().is_none());
            // Undoing the removal reproduces the identity
            // Far(parent) = Far(left) ∩ Far(right).
            let l_before: BTreeSet<MortonId> = left_far.union(&parent_far).copied().collect();
            let r_before: BTreeSet<MortonId> = right_far.union(&parent_far).copied().collect();
            let intersection: BTreeSet<MortonId> =
                l_before.intersection(&r_before).copied().collect();
            assert_eq!(intersection, parent_far);
        }
    })
    .unwrap();
}
