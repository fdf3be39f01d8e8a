/// Extended Isolation Forest.
/// Trees are grown by random hyperplane cuts over a row sample, packed into a fixed byte
/// layout, and only the packed form is used to score rows.
/// E.g.
/// An extension_level of 0 gives the classic axis-aligned isolation forest. An extension_level
/// of dim - 1 lets every hyperplane use all dimensions.
/// E.g.
/// Rows are plain &[f64] slices borrowed from a row-major matrix. Every row fed to a tree
/// must have the tree's dimension. The forest checks this, the tree internals do not.
pub mod compressed;
pub mod forest;
pub mod split;
pub mod stats;
pub mod tree;

pub use compressed::{decode_and_walk, CompressedTree};
pub use forest::{
    AnomalyMetrics, AnomalyScore, ForestAggregator, IsolationForest, IsolationForestParams,
    ScoringHistoryEntry, VariableSplits,
};
pub use split::{SplitCriteria, SplitGenerator};
pub use stats::{IsolationTreeStats, MetricSummary};
pub use tree::{IsolationTree, Node, TreeBuildStats};

use thiserror::Error;

/// Euler-Mascheroni constant
pub const EULER_GAMMA: f64 = 0.5772156649015329;

/// Score returned when the normalization term c(sample_size) is zero, i.e. every tree was
/// grown from a single row and no row can be told apart from another.
pub const DEGENERATE_ANOMALY_SCORE: f64 = 0.0;

#[derive(Debug, Error, PartialEq)]
pub enum IsoForestError {
    #[error("ntrees must be at least 1.")]
    NoTrees,
    #[error("sample_size must be a positive integer but it is {0}.")]
    InvalidSampleSize(usize),
    #[error("extension_level must be in [0, {max}] but it is {got}.")]
    InvalidExtensionLevel { got: usize, max: usize },
    #[error("k_planes must be in [1, {max}] but it is {got}.")]
    InvalidKPlanes { got: usize, max: usize },
    #[error("extension_level {extension_level} and k_planes {k_planes} disagree. Set only one of them.")]
    ConflictingExtension { extension_level: usize, k_planes: usize },
    #[error("contamination must be in (0, 0.5] but it is {0}.")]
    InvalidContamination(f64),
    #[error("Empty data.")]
    EmptyData,
    #[error("Input data contains non-finite values.")]
    NonFiniteValue,
    #[error("Input array is not contiguous.")]
    NotContiguous,
    #[error("Dimension mismatch: expected {expected} but got {got}.")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Compressed tree is corrupt: {0}")]
    CorruptTree(String),
    #[error("No threshold. Set contamination before fitting to use predict.")]
    NoThreshold,
}

/// Average path length of an unsuccessful search in a random binary search tree with n keys.
/// This is the expected depth still needed to isolate one of n points that a leaf could not
/// separate.
#[inline]
pub fn average_path_length(n: i64) -> f64 {
    if n <= 1 {
        0.
    } else if n == 2 {
        1.
    } else {
        let n = n as f64;
        2. * ((n - 1.).ln() + EULER_GAMMA) - 2. * (n - 1.) / n
    }
}

/// Anomaly score from the mean path length across trees.
/// 1 means isolated right away, values <= 0.5 are typical rows.
#[inline]
pub fn anomaly_score(mean_path_length: f64, sample_size: usize) -> f64 {
    let c = average_path_length(sample_size as i64);
    if c <= 0. {
        DEGENERATE_ANOMALY_SCORE
    } else {
        (-mean_path_length / c).exp2()
    }
}

/// Projects row - intercept onto the normal. Both the in-memory tree and the byte walker go
/// through here so they agree bit for bit. The sum runs in coordinate order.
#[inline(always)]
pub(crate) fn project<N, P>(row: &[f64], normal: N, intercept: P) -> f64
where
    N: Iterator<Item = f64>,
    P: Iterator<Item = f64>,
{
    row.iter()
        .copied()
        .zip(intercept)
        .zip(normal)
        .fold(0f64, |acc, ((x, p), n)| acc + (x - p) * n)
}

/// Negative projections go left. Ties and NaN go right.
#[inline(always)]
pub(crate) fn goes_left(z: f64) -> bool {
    z < 0.
}

/// A row's depth at the leaf it lands in, and the number of training rows in that leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafHit {
    pub depth: usize,
    pub n_rows: usize,
}

impl LeafHit {
    /// Depth plus the expected remaining depth of the rows the leaf did not separate.
    #[inline]
    pub fn path_length(&self) -> f64 {
        self.depth as f64 + average_path_length(self.n_rows as i64)
    }
}
