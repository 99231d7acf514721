use crate::DetailedError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error as ThisError;

/// Distance notion used by tree partitioning and neighbor search.
///
/// The operator always provides kernel entries; whether point geometry is
/// also available depends on the concrete operator. The `Geometric` metric
/// requires it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance between points.
    Geometric,
    /// Distance induced by the kernel itself: `K(i,i) + K(j,j) - 2 K(i,j)`.
    #[default]
    Kernel,
    /// Angular distance: `1 - K(i,j)^2 / (K(i,i) K(j,j))`.
    Angular,
}

/// How an h2mat run is laid out: a single process group of `ranks`
/// message-passing ranks, each with its own pool of `workers` threads.
///
/// The pairwise communicator-halving protocol used during tree construction
/// requires a power-of-two rank count. Every rank reserves one worker for
/// servicing remote block requests, so at least two workers per rank are
/// required.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    ranks: usize,
    workers: usize,
}

impl Topology {
    pub fn new(ranks: usize, workers: usize) -> Result<Self, ConfigError> {
        if ranks == 0 || !ranks.is_power_of_two() {
            return Err(ConfigError::RankCountNotPowerOfTwo { ranks });
        }
        if workers < 2 {
            return Err(ConfigError::TooFewWorkers { workers });
        }
        Ok(Self { ranks, workers })
    }

    /// Number of message-passing ranks in the group.
    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// Worker threads per rank, including the reserved server worker.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Worker threads available for computation (excludes the server slice).
    pub fn compute_workers(&self) -> usize {
        self.workers - 1
    }

    /// log2 of the rank count: the depth of the distributed tree portion.
    pub fn levels(&self) -> usize {
        self.ranks.trailing_zeros() as usize
    }
}

/// Tunables for one compression run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Problem size: number of rows/columns of the operator.
    pub problem_size: usize,

    /// Maximum number of indices a leaf node owns.
    pub leaf_size: usize,

    /// Number of approximate nearest neighbors kept per index.
    pub neighbors: usize,

    /// Randomized partition passes used by the neighbor search.
    pub neighbor_trees: usize,

    /// Maximum skeleton count per node.
    pub max_rank: usize,

    /// Target relative tolerance of the interpolative decomposition.
    pub tolerance: f64,

    /// Distance notion used for partitioning and neighbor search.
    pub metric: DistanceMetric,

    /// Fraction of leaf interactions exempted from compression and always
    /// evaluated exactly.
    pub budget: f64,

    /// Seed for every randomized decision in the run. Two runs with the same
    /// seed, problem and topology produce identical trees and skeletons.
    pub seed: u64,
}

impl CompressionConfig {
    pub fn new(problem_size: usize, leaf_size: usize) -> Self {
        Self {
            problem_size,
            leaf_size,
            neighbors: 32,
            neighbor_trees: 4,
            max_rank: 256,
            tolerance: 1e-5,
            metric: DistanceMetric::default(),
            budget: 0.01,
            seed: 0,
        }
    }

    /// Validates the configuration against a topology.
    ///
    /// Configurations that would make the tree degenerate are rejected here,
    /// before construction begins, never mid-build: the distributed
    /// communicator-halving recursion must end with every rank still holding
    /// at least one leaf of `leaf_size` indices.
    pub fn validate(&self, topology: &Topology) -> Result<(), ConfigError> {
        if self.problem_size == 0 {
            return Err(ConfigError::EmptyProblem);
        }
        if self.leaf_size == 0 {
            return Err(ConfigError::ZeroLeafSize);
        }
        if self.problem_size < topology.ranks() * self.leaf_size {
            return Err(ConfigError::TooFewPoints {
                problem_size: self.problem_size,
                required: topology.ranks() * self.leaf_size,
            });
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(ConfigError::InvalidTolerance {
                tolerance: self.tolerance,
            });
        }
        if !(0.0..=1.0).contains(&self.budget) {
            return Err(ConfigError::InvalidBudget { budget: self.budget });
        }
        if self.max_rank == 0 {
            return Err(ConfigError::ZeroMaxRank);
        }
        Ok(())
    }

    /// Total depth of the tree this configuration produces: the deepest level
    /// at which every node still holds at least `leaf_size` indices.
    pub fn tree_depth(&self) -> usize {
        let mut depth = 0usize;
        while (self.problem_size >> (depth + 1)) >= self.leaf_size {
            depth += 1;
        }
        depth
    }
}

/// Configuration errors, all reported before construction begins.
#[derive(Clone, Debug, PartialEq, Serialize, ThisError)]
pub enum ConfigError {
    #[error("rank count {ranks} is not a power of two")]
    RankCountNotPowerOfTwo { ranks: usize },

    #[error("{workers} worker threads per rank; at least 2 are required to reserve a request-servicing slice")]
    TooFewWorkers { workers: usize },

    #[error("problem size is zero")]
    EmptyProblem,

    #[error("leaf size is zero")]
    ZeroLeafSize,

    #[error("maximum rank is zero")]
    ZeroMaxRank,

    #[error("problem size {problem_size} is smaller than ranks * leaf_size = {required}")]
    TooFewPoints {
        problem_size: usize,
        required: usize,
    },

    #[error("tolerance {tolerance} is not a positive finite number")]
    InvalidTolerance { tolerance: f64 },

    #[error("budget {budget} is outside [0, 1]")]
    InvalidBudget { budget: f64 },

    #[error("the {0:?} metric requires an operator that exposes point geometry")]
    MetricRequiresGeometry(DistanceMetric),
}

impl DetailedError for ConfigError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::RankCountNotPowerOfTwo { .. } => Cow::from("RankCountNotPowerOfTwo"),
            Self::TooFewWorkers { .. } => Cow::from("TooFewWorkers"),
            Self::EmptyProblem => Cow::from("EmptyProblem"),
            Self::ZeroLeafSize => Cow::from("ZeroLeafSize"),
            Self::ZeroMaxRank => Cow::from("ZeroMaxRank"),
            Self::TooFewPoints { .. } => Cow::from("TooFewPoints"),
            Self::InvalidTolerance { .. } => Cow::from("InvalidTolerance"),
            Self::InvalidBudget { .. } => Cow::from("InvalidBudget"),
            Self::MetricRequiresGeometry(_) => Cow::from("MetricRequiresGeometry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_rejects_non_power_of_two() {
        assert!(matches!(
            Topology::new(3, 4),
            Err(ConfigError::RankCountNotPowerOfTwo { ranks: 3 })
        ));
        assert!(Topology::new(4, 4).is_ok());
    }

    #[test]
    fn topology_rejects_single_worker() {
        assert!(matches!(
            Topology::new(2, 1),
            Err(ConfigError::TooFewWorkers { workers: 1 })
        ));
    }

    #[test]
    fn config_rejects_undersized_problem() {
        let topology = Topology::new(4, 2).unwrap();
        let config = CompressionConfig::new(100, 64);
        assert!(matches!(
            config.validate(&topology),
            Err(ConfigError::TooFewPoints { required: 256, .. })
        ));
    }

    #[test]
    fn tree_depth_matches_leaf_budget() {
        // 1024 points with 64-point leaves: 4 levels halve 1024 down to 64.
        let config = CompressionConfig::new(1024, 64);
        assert_eq!(config.tree_depth(), 4);
        // One extra point does not buy another level.
        let config = CompressionConfig::new(1025, 64);
        assert_eq!(config.tree_depth(), 4);
        // Doubling does.
        let config = CompressionConfig::new(2048, 64);
        assert_eq!(config.tree_depth(), 5);
    }
}
