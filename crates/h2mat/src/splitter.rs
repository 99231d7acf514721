//! Tree splitters.
//!
//! A splitter decides which half of a node's index set each index belongs
//! to; it never moves data (the tree performs the physical exchange after
//! the decision). Both policies come in a single-process and a
//! cross-process flavor through the same entry point: a solo communicator
//! makes every collective degenerate to its local meaning.
//!
//! * [`CenterSplit`] projects every index onto the axis between the two
//!   most mutually distant points (found by two global max-reductions) and
//!   splits at the exact global median of the projections.
//! * [`RandomSplit`] picks the two pivot points uniformly at random instead,
//!   then applies the same projection/median procedure.

use crate::comm::{Communicator, Tag};
use crate::kernel::KernelOperator;
use crate::tags;
use crate::Gid;
use h2mat_types::DistanceMetric;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Width of the numerical tie band around the median. Projections within
/// the band are distributed between the halves by quota instead of by
/// comparison, which is what absorbs degenerate (zero-spread) inputs.
const TIE_BAND: f64 = 1e-6;

/// Number of columns sampled to approximate the cluster centroid.
const CENTROID_SAMPLES: usize = 32;

/// Membership decision for one node split: positions into the owned gid
/// slice, not gids themselves.
#[derive(Debug, Default)]
pub struct SplitParts {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
}

/// Everything a policy needs to decide one split.
pub struct SplitInput<'a> {
    pub operator: &'a dyn KernelOperator,
    pub metric: DistanceMetric,
    /// Indices owned by this rank at the node being split.
    pub gids: &'a [Gid],
    /// The node's communicator; solo for local splits.
    pub comm: &'a Communicator,
    /// Global tree level of the node, used to separate message rounds.
    pub level: u32,
    /// Seed for this node's randomized decisions, identical on every rank
    /// of the communicator.
    pub seed: u64,
}

pub trait SplitPolicy: Send + Sync {
    fn split(&self, input: &SplitInput<'_>) -> SplitParts;
}

/// Geometric-center policy: pivots are the farthest point from an
/// approximate centroid and the farthest point from that pivot.
pub struct CenterSplit;

/// Random-pivot policy: two distinct pivots chosen by rank 0 and broadcast.
pub struct RandomSplit;

impl SplitPolicy for CenterSplit {
    fn split(&self, input: &SplitInput<'_>) -> SplitParts {
        let comm = input.comm;
        let tag = tags::SPLIT.at_level(input.level);
        let n: usize = comm.allreduce(tag, input.gids.len(), |a, b| a + b);
        if n == 0 {
            return SplitParts::default();
        }

        let diag = input.operator.diagonal(input.gids);

        // Distance of every owned index to the sampled centroid.
        let to_centroid = centroid_distances(input, &diag);

        // First pivot: globally farthest from the centroid, ties to the
        // lowest rank.
        let pivot_p = broadcast_argmax(input, &to_centroid, tag.seq(1 << 8));

        // Second pivot: globally farthest from the first.
        let to_p = pivot_distances(input, &diag, &pivot_p);
        let pivot_q = broadcast_argmax(input, &to_p, tag.seq(2 << 8));
        let to_q = pivot_distances(input, &diag, &pivot_q);

        let projection: Vec<f64> = to_p.iter().zip(&to_q).map(|(p, q)| p - q).collect();
        median_split(input, n, &projection, tag)
    }
}

impl SplitPolicy for RandomSplit {
    fn split(&self, input: &SplitInput<'_>) -> SplitParts {
        let comm = input.comm;
        let tag = tags::SPLIT.at_level(input.level);
        let n: usize = comm.allreduce(tag, input.gids.len(), |a, b| a + b);
        if n == 0 {
            return SplitParts::default();
        }

        let diag = input.operator.diagonal(input.gids);

        // Rank 0 draws two distinct local pivots and broadcasts them with
        // their diagonal entries, so no rank needs remote rows.
        let pivots = if comm.rank() == 0 {
            let mut rng = ChaCha8Rng::seed_from_u64(input.seed);
            assert!(
                input.gids.len() >= 2,
                "random split needs at least two points on rank 0"
            );
            let a = rng.gen_range(0..input.gids.len());
            let mut b = rng.gen_range(0..input.gids.len());
            while b == a {
                b = rng.gen_range(0..input.gids.len());
            }
            Some((
                Pivot {
                    gid: input.gids[a],
                    diagonal: diag[a],
                    point: point_of(input, input.gids[a]),
                },
                Pivot {
                    gid: input.gids[b],
                    diagonal: diag[b],
                    point: point_of(input, input.gids[b]),
                },
            ))
        } else {
            None
        };
        let (pivot_p, pivot_q) = comm.broadcast(0, tag.seq(6 << 8), pivots);

        let to_p = pivot_distances(input, &diag, &pivot_p);
        let to_q = pivot_distances(input, &diag, &pivot_q);
        let projection: Vec<f64> = to_p.iter().zip(&to_q).map(|(p, q)| p - q).collect();
        median_split(input, n, &projection, tag)
    }
}

/// A pivot point, self-contained so that every rank can compute distances
/// to it from locally held rows only.
#[derive(Clone, Debug)]
struct Pivot {
    gid: Gid,
    diagonal: f64,
    point: Option<Vec<f64>>,
}

fn point_of(input: &SplitInput<'_>, gid: Gid) -> Option<Vec<f64>> {
    input
        .operator
        .geometry()
        .map(|points| points.point(gid).to_vec())
}

/// Distance of every owned index to a centroid approximated from the first
/// [`CENTROID_SAMPLES`] locally owned columns.
fn centroid_distances(input: &SplitInput<'_>, diag: &[f64]) -> Vec<f64> {
    let gids = input.gids;
    let samples = &gids[..gids.len().min(CENTROID_SAMPLES)];
    match input.metric {
        DistanceMetric::Geometric => {
            let points = input
                .operator
                .geometry()
                .expect("geometric metric requires operator geometry");
            let dim = points.dim();
            let mut centroid = vec![0.0; dim];
            for &gid in samples {
                for (c, x) in centroid.iter_mut().zip(points.point(gid)) {
                    *c += x;
                }
            }
            for c in centroid.iter_mut() {
                *c /= samples.len() as f64;
            }
            gids.iter()
                .map(|&gid| {
                    points
                        .point(gid)
                        .iter()
                        .zip(&centroid)
                        .map(|(x, c)| (x - c) * (x - c))
                        .sum()
                })
                .collect()
        }
        DistanceMetric::Kernel => {
            let sample_block = input.operator.block(gids, samples);
            let sample_diag = input.operator.diagonal(samples);
            let mean_cc = sample_diag.iter().sum::<f64>() / samples.len() as f64;
            (0..gids.len())
                .map(|i| {
                    let mean_ic = (0..samples.len())
                        .map(|c| sample_block[(i, c)])
                        .sum::<f64>()
                        / samples.len() as f64;
                    diag[i] - 2.0 * mean_ic + mean_cc
                })
                .collect()
        }
        DistanceMetric::Angular => {
            let sample_block = input.operator.block(gids, samples);
            let sample_diag = input.operator.diagonal(samples);
            (0..gids.len())
                .map(|i| {
                    (0..samples.len())
                        .map(|c| {
                            let k = sample_block[(i, c)];
                            1.0 - k * k / (diag[i] * sample_diag[c])
                        })
                        .sum::<f64>()
                        / samples.len() as f64
                })
                .collect()
        }
    }
}

/// Distance of every owned index to one pivot.
fn pivot_distances(input: &SplitInput<'_>, diag: &[f64], pivot: &Pivot) -> Vec<f64> {
    match input.metric {
        DistanceMetric::Geometric => {
            let points = input
                .operator
                .geometry()
                .expect("geometric metric requires operator geometry");
            let pivot_point = pivot
                .point
                .as_ref()
                .expect("geometric pivot carries its point");
            input
                .gids
                .iter()
                .map(|&gid| {
                    points
                        .point(gid)
                        .iter()
                        .zip(pivot_point)
                        .map(|(x, p)| (x - p) * (x - p))
                        .sum()
                })
                .collect()
        }
        DistanceMetric::Kernel => {
            let column = input.operator.block(input.gids, &[pivot.gid]);
            (0..input.gids.len())
                .map(|i| diag[i] + pivot.diagonal - 2.0 * column[(i, 0)])
                .collect()
        }
        DistanceMetric::Angular => {
            let column = input.operator.block(input.gids, &[pivot.gid]);
            (0..input.gids.len())
                .map(|i| {
                    let k = column[(i, 0)];
                    1.0 - k * k / (diag[i] * pivot.diagonal)
                })
                .collect()
        }
    }
}

/// Finds the global argmax of `values` keyed by `(value, rank)` with ties
/// broken toward the lowest rank, and broadcasts the winning pivot.
fn broadcast_argmax(input: &SplitInput<'_>, values: &[f64], tag: Tag) -> Pivot {
    let comm = input.comm;
    let (local_best, local_pos) = values
        .iter()
        .copied()
        .enumerate()
        .map(|(i, v)| (v, i))
        .fold((f64::NEG_INFINITY, 0usize), |acc, (v, i)| {
            if v > acc.0 {
                (v, i)
            } else {
                acc
            }
        });
    let (_, owner) = comm.allreduce_max_loc(tag, local_best);
    let pivot = (comm.rank() == owner).then(|| {
        let gid = input.gids[local_pos];
        Pivot {
            gid,
            diagonal: input.operator.diagonal(&[gid])[0],
            point: point_of(input, gid),
        }
    });
    comm.broadcast(owner, tag.seq(1), pivot)
}

/// Selects the exact global median of the projections, then assigns indices
/// to halves, resolving the tie band so the halves reach exactly
/// `ceil(n/2)` / `floor(n/2)`.
fn median_split(
    input: &SplitInput<'_>,
    n: usize,
    projection: &[f64],
    tag: Tag,
) -> SplitParts {
    let comm = input.comm;
    let median = select_kth(projection.to_vec(), n / 2, comm, tag.seq(5 << 8), input.seed);

    let mut parts = SplitParts::default();
    let mut middle = Vec::new();
    for (i, &value) in projection.iter().enumerate() {
        if (value - median).abs() < TIE_BAND && value.is_finite() {
            middle.push(i);
        } else if value < median {
            parts.left.push(i);
        } else {
            parts.right.push(i);
        }
    }

    let (n_left, n_mid) = comm.allreduce(
        tag.seq(3 << 8),
        (parts.left.len(), middle.len()),
        |a, b| (a.0 + b.0, a.1 + b.1),
    );
    if n_mid > 0 {
        // The larger half is topped up to ceil(n/2); the tie band supplies
        // the difference. A true median split cannot require a negative
        // count here; if it does, the selection above is broken.
        let n_right = n - n_left - n_mid;
        let left_quota = if n_left > n_right {
            n.div_ceil(2)
                .checked_sub(n_left)
                .expect("median split produced an oversized left half")
        } else {
            let right_quota = n
                .div_ceil(2)
                .checked_sub(n_right)
                .expect("median split produced an oversized right half");
            n_mid
                .checked_sub(right_quota)
                .expect("tie-band rebalance computed a negative requirement")
        };
        assert!(
            left_quota <= n_mid,
            "tie-band rebalance requires {left_quota} of {n_mid} middle points"
        );

        // Exact per-rank quotas via an exclusive prefix sum of middle
        // counts, so the global halves land on ceil/floor exactly.
        let mid_counts = comm.allgatherv(tag.seq(4 << 8), vec![middle.len()]);
        let before: usize = mid_counts[..comm.rank()].iter().sum();
        let take_left = left_quota.saturating_sub(before).min(middle.len());
        for (k, &pos) in middle.iter().enumerate() {
            if k < take_left {
                parts.left.push(pos);
            } else {
                parts.right.push(pos);
            }
        }
    }
    debug_assert_eq!(parts.left.len() + parts.right.len(), projection.len());
    parts
}

/// Distributed order-statistic selection: the `k`-th smallest (0-based) of
/// the union of every rank's `values`.
pub(crate) fn select_kth(
    mut values: Vec<f64>,
    mut k: usize,
    comm: &Communicator,
    tag: Tag,
    seed: u64,
) -> f64 {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5e1e_c7ed);
    let mut round = 0u64;
    loop {
        round += 1;
        let round_tag = tag.seq((1 << 16) + round * 8);

        // Every rank contributes a few pivot candidates; rank 0 draws one.
        let mut sample: Vec<f64> = values.iter().copied().take(3).collect();
        sample = comm.allgatherv(round_tag, sample);
        let pivot = if comm.rank() == 0 {
            Some(*sample.choose(&mut rng).expect("selection ran out of values"))
        } else {
            None
        };
        let pivot = comm.broadcast(0, round_tag.seq(1), pivot);

        let less = values.iter().filter(|&&v| v < pivot).count();
        let equal = values.iter().filter(|&&v| v == pivot).count();
        let (g_less, g_equal) = comm.allreduce(round_tag.seq(2), (less, equal), |a, b| {
            (a.0 + b.0, a.1 + b.1)
        });

        if k < g_less {
            values.retain(|&v| v < pivot);
        } else if k < g_less + g_equal {
            return pivot;
        } else {
            k -= g_less + g_equal;
            values.retain(|&v| v > pivot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ProcessGroup;
    use crate::kernel::{DenseKernel, GaussianKernel, PointSet};
    use faer::Mat;
    use std::sync::Arc;
    use std::thread;

    fn run_on_ranks<F>(ranks: usize, f: F)
    where
        F: Fn(Communicator) + Send + Sync + 'static,
    {
        let comms = ProcessGroup::new(ranks);
        let f = Arc::new(f);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || (*f)(comm))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    fn line_points(n: usize) -> PointSet {
        PointSet::new(1, (0..n).map(|i| i as f64).collect())
    }

    #[test]
    fn select_kth_matches_sorted_order() {
        run_on_ranks(4, |comm| {
            let rank = comm.rank();
            // Rank r owns values r, r+4, r+8, ..., r+28.
            let values: Vec<f64> = (0..8).map(|i| (i * 4 + rank) as f64).collect();
            for k in [0, 1, 15, 16, 30, 31] {
                let v = select_kth(values.clone(), k, &comm, Tag::test(30).seq(k as u64 * 100), 7);
                assert_eq!(v, k as f64);
            }
        });
    }

    #[test]
    fn select_kth_handles_duplicates() {
        run_on_ranks(2, |comm| {
            let values = vec![5.0; 10];
            let v = select_kth(values, 9, &comm, Tag::test(31), 3);
            assert_eq!(v, 5.0);
        });
    }

    #[test]
    fn center_split_separates_a_line_evenly() {
        let n = 64;
        let operator = GaussianKernel::new(line_points(n), 8.0);
        let comm = ProcessGroup::new(1).pop().unwrap();
        let gids: Vec<Gid> = (0..n).collect();
        let parts = CenterSplit.split(&SplitInput {
            operator: &operator,
            metric: DistanceMetric::Geometric,
            gids: &gids,
            comm: &comm,
            level: 0,
            seed: 1,
        });
        assert_eq!(parts.left.len(), 32);
        assert_eq!(parts.right.len(), 32);
        // The halves are the two ends of the line, whichever side each lands.
        let mut left: Vec<Gid> = parts.left.iter().map(|&i| gids[i]).collect();
        left.sort_unstable();
        assert!(left == (0..32).collect::<Vec<_>>() || left == (32..64).collect::<Vec<_>>());
    }

    #[test]
    fn degenerate_coincident_points_still_balance() {
        // All points identical: every projection ties; the band must deliver
        // a ceil/floor split rather than recursing or collapsing.
        let n = 33;
        let operator = DenseKernel::new(Mat::from_fn(n, n, |_, _| 1.0));
        let comm = ProcessGroup::new(1).pop().unwrap();
        let gids: Vec<Gid> = (0..n).collect();
        let parts = RandomSplit.split(&SplitInput {
            operator: &operator,
            metric: DistanceMetric::Kernel,
            gids: &gids,
            comm: &comm,
            level: 0,
            seed: 9,
        });
        let sizes = [parts.left.len(), parts.right.len()];
        assert_eq!(sizes.iter().sum::<usize>(), n);
        assert!(sizes[0].abs_diff(sizes[1]) <= 1);
    }

    #[test]
    fn distributed_split_is_balanced_and_disjoint() {
        let n = 128;
        run_on_ranks(4, move |comm| {
            let rank = comm.rank();
            let gids: Vec<Gid> = (0..n).filter(|g| g % 4 == rank).collect();
            let operator = GaussianKernel::new(line_points(n), 16.0);
            let parts = CenterSplit.split(&SplitInput {
                operator: &operator,
                metric: DistanceMetric::Geometric,
                gids: &gids,
                comm: &comm,
                level: 0,
                seed: 42,
            });
            let local = parts.left.len() + parts.right.len();
            assert_eq!(local, gids.len());
            let (g_left, g_right) = comm.allreduce(
                Tag::test(32),
                (parts.left.len(), parts.right.len()),
                |a, b| (a.0 + b.0, a.1 + b.1),
            );
            assert_eq!(g_left + g_right, n);
            assert!(g_left.abs_diff(g_right) <= 1);
        });
    }
}
