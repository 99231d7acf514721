//! Narrow dense linear-algebra layer.
//!
//! Everything the engine needs from dense kernels goes through here:
//! matrix multiply (faer), and the rank-revealing interpolative
//! decomposition built on a column-pivoted Householder QR with a
//! back-substitution triangular solve. All functions are pure over
//! caller-provided matrices.

use faer::Mat;

/// Result of a successful interpolative decomposition of `A`:
/// `A[:, j] ≈ A[:, skeleton] * proj[:, j]` for every column `j`.
pub struct Interpolation {
    /// Selected column indices, in pivot order.
    pub skeleton: Vec<usize>,
    /// `skeleton.len() × ncols` coefficient matrix.
    pub proj: Mat<f64>,
}

/// Rank-revealing interpolative decomposition.
///
/// Greedy column-pivoted QR runs until the largest residual column norm
/// drops below `tol` relative to the largest initial column norm, or until
/// `max_rank` columns have been taken. Returns `None` when `max_rank`
/// columns cannot reach the tolerance: the caller treats that block as
/// incompressible. A zero matrix yields an empty skeleton, which callers
/// also treat as incompressible.
pub fn interpolative(a: &Mat<f64>, max_rank: usize, tol: f64) -> Option<Interpolation> {
    let m = a.nrows();
    let n = a.ncols();
    let kmax = max_rank.min(m).min(n);

    let mut r = a.to_owned();
    let mut perm: Vec<usize> = (0..n).collect();
    let mut norms: Vec<f64> = (0..n)
        .map(|j| (0..m).map(|i| r[(i, j)] * r[(i, j)]).sum())
        .collect();
    let scale = norms.iter().cloned().fold(0.0, f64::max).sqrt();
    if scale == 0.0 {
        return Some(Interpolation {
            skeleton: Vec::new(),
            proj: Mat::zeros(0, n),
        });
    }
    let threshold = tol * scale;

    let mut rank = kmax;
    let mut converged = false;
    for k in 0..kmax {
        // Pivot: the column with the largest residual norm.
        let (pivot, pivot_norm) = (k..n)
            .map(|j| (j, norms[j]))
            .fold((k, f64::NEG_INFINITY), |acc, (j, v)| {
                if v > acc.1 {
                    (j, v)
                } else {
                    acc
                }
            });
        if pivot_norm.max(0.0).sqrt() <= threshold {
            rank = k;
            converged = true;
            break;
        }
        if pivot != k {
            for i in 0..m {
                let tmp = r[(i, k)];
                r[(i, k)] = r[(i, pivot)];
                r[(i, pivot)] = tmp;
            }
            perm.swap(k, pivot);
            norms.swap(k, pivot);
        }

        // Householder reflector annihilating rows k+1.. of column k.
        let mut norm_x: f64 = (k..m).map(|i| r[(i, k)] * r[(i, k)]).sum();
        norm_x = norm_x.sqrt();
        if norm_x == 0.0 {
            rank = k;
            converged = true;
            break;
        }
        let alpha = if r[(k, k)] >= 0.0 { -norm_x } else { norm_x };
        let mut v: Vec<f64> = (k..m).map(|i| r[(i, k)]).collect();
        v[0] -= alpha;
        let v_norm2: f64 = v.iter().map(|x| x * x).sum();

        r[(k, k)] = alpha;
        for i in k + 1..m {
            r[(i, k)] = 0.0;
        }
        if v_norm2 > 0.0 {
            for j in k + 1..n {
                let dot: f64 = (k..m).map(|i| v[i - k] * r[(i, j)]).sum();
                let coeff = 2.0 * dot / v_norm2;
                for i in k..m {
                    r[(i, j)] -= coeff * v[i - k];
                }
            }
        }
        // Downdate residual norms of the trailing columns.
        for j in k + 1..n {
            norms[j] = (norms[j] - r[(k, j)] * r[(k, j)]).max(0.0);
        }
    }

    if !converged && kmax < m && kmax < n {
        let worst = norms[kmax..].iter().cloned().fold(0.0, f64::max).sqrt();
        if worst > threshold {
            return None;
        }
    }

    // proj solves R11 * T = R12 and scatters [I | T] back to the original
    // column order.
    let t = solve_upper_triangular(&r, rank, n);
    let mut proj = Mat::zeros(rank, n);
    for (i, &col) in perm.iter().take(rank).enumerate() {
        proj[(i, col)] = 1.0;
    }
    for (j, &col) in perm.iter().skip(rank).enumerate() {
        for i in 0..rank {
            proj[(i, col)] = t[(i, j)];
        }
    }

    Some(Interpolation {
        skeleton: perm[..rank].to_vec(),
        proj,
    })
}

/// Solves `R[..rank, ..rank] * T = R[..rank, rank..]` by back
/// substitution; `R`'s leading block is upper triangular.
fn solve_upper_triangular(r: &Mat<f64>, rank: usize, n: usize) -> Mat<f64> {
    let trailing = n - rank;
    let mut t = Mat::zeros(rank, trailing);
    for c in 0..trailing {
        for i in (0..rank).rev() {
            let mut sum = r[(i, rank + c)];
            for j in i + 1..rank {
                sum -= r[(i, j)] * t[(j, c)];
            }
            t[(i, c)] = sum / r[(i, i)];
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_low_rank(m: usize, n: usize, rank: usize, seed: u64) -> Mat<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let u = Mat::from_fn(m, rank, |_, _| rng.gen_range(-1.0..1.0));
        let v = Mat::from_fn(rank, n, |_, _| rng.gen_range(-1.0..1.0));
        &u * &v
    }

    fn reconstruction_error(a: &Mat<f64>, id: &Interpolation) -> f64 {
        let skel = Mat::from_fn(a.nrows(), id.skeleton.len(), |i, j| a[(i, id.skeleton[j])]);
        let approx = &skel * &id.proj;
        let mut worst: f64 = 0.0;
        for j in 0..a.ncols() {
            let err: f64 = (0..a.nrows())
                .map(|i| (a[(i, j)] - approx[(i, j)]).powi(2))
                .sum::<f64>()
                .sqrt();
            worst = worst.max(err);
        }
        worst
    }

    #[test]
    fn exact_rank_is_recovered() {
        let a = random_low_rank(40, 30, 7, 1);
        let id = interpolative(&a, 20, 1e-10).unwrap();
        assert!(id.skeleton.len() <= 7, "rank {} > 7", id.skeleton.len());
        assert!(reconstruction_error(&a, &id) < 1e-8);
    }

    #[test]
    fn tolerance_bounds_the_residual() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        // Low-rank plus small noise: loose tolerance keeps the rank small,
        // and the residual stays within the bound.
        let base = random_low_rank(50, 40, 5, 3);
        let a = Mat::from_fn(50, 40, |i, j| base[(i, j)] + 1e-9 * rng.gen_range(-1.0..1.0));
        let id = interpolative(&a, 40, 1e-6).unwrap();
        assert!(id.skeleton.len() <= 8);
        assert!(reconstruction_error(&a, &id) < 1e-4);
    }

    #[test]
    fn rank_budget_failure_is_reported() {
        // A well-conditioned full-rank matrix cannot be represented by 3
        // columns at near-machine tolerance.
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let a = Mat::from_fn(30, 30, |_, _| rng.gen_range(-1.0..1.0));
        assert!(interpolative(&a, 3, 1e-12).is_none());
    }

    #[test]
    fn zero_matrix_yields_empty_skeleton() {
        let a = Mat::<f64>::zeros(10, 6);
        let id = interpolative(&a, 4, 1e-8).unwrap();
        assert!(id.skeleton.is_empty());
        assert_eq!(id.proj.nrows(), 0);
    }

    #[test]
    fn skeleton_columns_reproduce_themselves() {
        let a = random_low_rank(20, 12, 4, 5);
        let id = interpolative(&a, 12, 1e-10).unwrap();
        for (i, &col) in id.skeleton.iter().enumerate() {
            for k in 0..id.skeleton.len() {
                let expect = if k == i { 1.0 } else { 0.0 };
                assert!((id.proj[(k, col)] - expect).abs() < 1e-12);
            }
        }
    }
}
