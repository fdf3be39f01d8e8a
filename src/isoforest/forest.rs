use super::{
    anomaly_score, CompressedTree, IsoForestError, IsolationTree, IsolationTreeStats,
    MetricSummary, Node, SplitGenerator, TreeBuildStats, DEGENERATE_ANOMALY_SCORE,
};
use crate::utils::split_offsets;
use log::{debug, info, warn};
use ndarray::ArrayView2;
use ordered_float::OrderedFloat;
use rand::{seq::index, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn default_ntrees() -> usize {
    100
}

fn default_sample_size() -> usize {
    256
}

fn default_parallel() -> bool {
    true
}

/// Training parameters. Also the kwargs of the polars expression, so every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsolationForestParams {
    #[serde(default = "default_ntrees")]
    pub ntrees: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default)]
    pub extension_level: usize,
    // Dimensions cut by each hyperplane, i.e. extension_level + 1. Wins over extension_level.
    #[serde(default)]
    pub k_planes: Option<usize>,
    // None means ceil(log2(sample_size))
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub contamination: Option<f64>,
    // 0 disables the scoring history
    #[serde(default)]
    pub score_tree_interval: usize,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        IsolationForestParams {
            ntrees: default_ntrees(),
            sample_size: default_sample_size(),
            extension_level: 0,
            k_planes: None,
            max_depth: None,
            seed: None,
            contamination: None,
            score_tree_interval: 0,
            parallel: default_parallel(),
        }
    }
}

impl IsolationForestParams {
    pub fn validate(&self, dim: usize) -> Result<(), IsoForestError> {
        if self.ntrees == 0 {
            return Err(IsoForestError::NoTrees);
        }
        if self.sample_size == 0 {
            return Err(IsoForestError::InvalidSampleSize(self.sample_size));
        }
        if dim == 0 {
            return Err(IsoForestError::EmptyData);
        }
        if self.extension_level > dim - 1 {
            return Err(IsoForestError::InvalidExtensionLevel {
                got: self.extension_level,
                max: dim - 1,
            });
        }
        if let Some(k) = self.k_planes {
            if k == 0 || k > dim {
                return Err(IsoForestError::InvalidKPlanes { got: k, max: dim });
            }
            // extension_level 0 is the default, so it reads as unset next to k_planes.
            if self.extension_level != 0 && self.extension_level != k - 1 {
                return Err(IsoForestError::ConflictingExtension {
                    extension_level: self.extension_level,
                    k_planes: k,
                });
            }
        }
        if let Some(q) = self.contamination {
            if !(q > 0. && q <= 0.5) {
                return Err(IsoForestError::InvalidContamination(q));
            }
        }
        Ok(())
    }

    pub fn effective_extension_level(&self) -> usize {
        match self.k_planes {
            Some(k) => k.saturating_sub(1),
            None => self.extension_level,
        }
    }

    /// Height limit for trees grown from sample_size rows.
    pub fn height_limit(&self, sample_size: usize) -> usize {
        self.max_depth
            .unwrap_or_else(|| sample_size.max(1).next_power_of_two().trailing_zeros() as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub anomaly_score: f64,
    pub mean_length: f64,
}

/// Folds one row's path lengths, tree by tree, into its mean length and anomaly score.
#[derive(Clone, Copy, Debug)]
pub struct ForestAggregator {
    sample_size: usize,
    sum: f64,
    ntrees: usize,
}

impl ForestAggregator {
    pub fn new(sample_size: usize) -> Self {
        ForestAggregator {
            sample_size,
            sum: 0.,
            ntrees: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, path_length: f64) {
        self.sum += path_length;
        self.ntrees += 1;
    }

    pub fn ntrees(&self) -> usize {
        self.ntrees
    }

    #[inline]
    pub fn score(&self) -> AnomalyScore {
        if self.ntrees == 0 {
            AnomalyScore {
                anomaly_score: DEGENERATE_ANOMALY_SCORE,
                mean_length: 0.,
            }
        } else {
            let mean_length = self.sum / self.ntrees as f64;
            AnomalyScore {
                anomaly_score: anomaly_score(mean_length, self.sample_size),
                mean_length,
            }
        }
    }
}

/// Per feature usage of the hyperplanes: how many splits use it, the summed split imbalance
/// |n_left - n_right| / n, and the summed depth + 1 of those splits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSplits {
    count: Vec<usize>,
    split_ratio: Vec<f64>,
    depth: Vec<usize>,
}

impl VariableSplits {
    pub fn new(dim: usize) -> Self {
        VariableSplits {
            count: vec![0; dim],
            split_ratio: vec![0.; dim],
            depth: vec![0; dim],
        }
    }

    pub fn update_by(&mut self, tree: &IsolationTree) {
        let nodes = tree.nodes();
        for node in nodes.iter() {
            if let Node::Split {
                criteria,
                left,
                right,
                depth,
                ..
            } = node
            {
                let n_left = nodes[*left].n_rows() as f64;
                let n_right = nodes[*right].n_rows() as f64;
                let ratio = (n_left - n_right).abs() / (n_left + n_right);
                for i in criteria.active_dims() {
                    self.count[i] += 1;
                    self.split_ratio[i] += ratio;
                    self.depth[i] += depth + 1;
                }
            }
        }
    }

    pub fn merge(&mut self, other: &VariableSplits) {
        for (x, y) in self.count.iter_mut().zip(other.count.iter()) {
            *x += y;
        }
        for (x, y) in self.split_ratio.iter_mut().zip(other.split_ratio.iter()) {
            *x += y;
        }
        for (x, y) in self.depth.iter_mut().zip(other.depth.iter()) {
            *x += y;
        }
    }

    pub fn count(&self) -> &[usize] {
        &self.count
    }

    pub fn split_ratio(&self) -> &[f64] {
        &self.split_ratio
    }

    pub fn depth(&self) -> &[usize] {
        &self.depth
    }
}

/// Summary of the scores over a set of rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMetrics {
    pub anomaly_score: MetricSummary,
    pub mean_length: MetricSummary,
}

impl AnomalyMetrics {
    pub fn update(&mut self, score: &AnomalyScore) {
        self.anomaly_score.update(score.anomaly_score);
        self.mean_length.update(score.mean_length);
    }

    pub fn merge(&mut self, other: &AnomalyMetrics) {
        self.anomaly_score.merge(&other.anomaly_score);
        self.mean_length.merge(&other.mean_length);
    }

    pub fn mean_anomaly_score(&self) -> f64 {
        self.anomaly_score.mean().unwrap_or(DEGENERATE_ANOMALY_SCORE)
    }

    pub fn mean_length(&self) -> f64 {
        self.mean_length.mean().unwrap_or(0.)
    }

    pub fn min_path_length(&self) -> Option<f64> {
        self.mean_length.min()
    }

    pub fn max_path_length(&self) -> Option<f64> {
        self.mean_length.max()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringHistoryEntry {
    pub ntrees: usize,
    pub mean_length: f64,
    pub mean_anomaly_score: f64,
}

// Standard layout rows. The array must outlive the rows.
fn as_rows(flat: &[f64], dim: usize) -> Vec<&[f64]> {
    flat.chunks_exact(dim).collect()
}

// Linear interpolation between the closest ranks, like numpy's default.
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by_key(|x| OrderedFloat(*x));
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// A fitted extended isolation forest. Only the compressed trees are kept.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IsolationForest {
    params: IsolationForestParams,
    dim: usize,
    sample_size: usize,
    height_limit: usize,
    trees: Vec<CompressedTree>,
    tree_stats: IsolationTreeStats,
    variable_splits: VariableSplits,
    training_metrics: AnomalyMetrics,
    scoring_history: Vec<ScoringHistoryEntry>,
    threshold: Option<f64>,
}

impl IsolationForest {
    pub fn fit(
        data: ArrayView2<f64>,
        params: &IsolationForestParams,
    ) -> Result<Self, IsoForestError> {
        Self::fit_score(data, params).map(|(model, _)| model)
    }

    /// Fits the forest and returns it with the scores of the training rows, which fitting
    /// computes anyway for the metrics.
    pub fn fit_score(
        data: ArrayView2<f64>,
        params: &IsolationForestParams,
    ) -> Result<(Self, Vec<AnomalyScore>), IsoForestError> {
        let (n_rows, dim) = data.dim();
        if n_rows == 0 {
            return Err(IsoForestError::EmptyData);
        }
        params.validate(dim)?;
        if data.iter().any(|x| !x.is_finite()) {
            return Err(IsoForestError::NonFiniteValue);
        }

        let data = data.as_standard_layout();
        let rows = as_rows(data.as_slice().ok_or(IsoForestError::NotContiguous)?, dim);

        let sample_size = if params.sample_size > n_rows {
            warn!(
                "sample_size {} is larger than the number of rows {}. Using all rows.",
                params.sample_size, n_rows
            );
            n_rows
        } else {
            params.sample_size
        };
        let height_limit = params.height_limit(sample_size);

        // Seeds are drawn up front so the trees don't depend on how rayon schedules them.
        let mut master = match params.seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        let seeds = (0..params.ntrees)
            .map(|_| master.gen::<u64>())
            .collect::<Vec<_>>();

        let generator = SplitGenerator::new(dim, params.effective_extension_level())?;
        let grow = |(i, seed): (usize, u64)| -> (CompressedTree, TreeBuildStats, VariableSplits) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut sample = index::sample(&mut rng, n_rows, sample_size)
                .into_iter()
                .map(|j| rows[j])
                .collect::<Vec<_>>();
            let tree = IsolationTree::build(&mut sample, generator, height_limit, &mut rng);
            debug!("Tree {} built. {:?}", i, tree.stats());
            let mut splits = VariableSplits::new(dim);
            splits.update_by(&tree);
            (CompressedTree::encode(&tree), *tree.stats(), splits)
        };

        let built: Vec<(CompressedTree, TreeBuildStats, VariableSplits)> = if params.parallel {
            seeds.into_par_iter().enumerate().map(grow).collect()
        } else {
            seeds.into_iter().enumerate().map(grow).collect()
        };

        let mut trees = Vec::with_capacity(built.len());
        let mut tree_stats = IsolationTreeStats::new();
        let mut variable_splits = VariableSplits::new(dim);
        for (tree, stats, splits) in built {
            tree_stats.record(&stats);
            variable_splits.merge(&splits);
            trees.push(tree);
        }

        let mut model = IsolationForest {
            params: params.clone(),
            dim,
            sample_size,
            height_limit,
            trees,
            tree_stats,
            variable_splits,
            training_metrics: AnomalyMetrics::default(),
            scoring_history: Vec::new(),
            threshold: None,
        };

        let ntrees = model.ntrees();
        let mut checkpoints = if params.score_tree_interval > 0 {
            (0..=ntrees)
                .filter(|k| k % params.score_tree_interval == 0)
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        if checkpoints.last() != Some(&ntrees) {
            checkpoints.push(ntrees);
        }
        let (scores, metrics) = model.score_rows(&rows, ntrees, &checkpoints, params.parallel)?;

        model.training_metrics = metrics.last().copied().unwrap_or_default();
        if params.score_tree_interval > 0 {
            model.scoring_history = checkpoints
                .iter()
                .zip(metrics.iter())
                .map(|(k, m)| ScoringHistoryEntry {
                    ntrees: *k,
                    mean_length: m.mean_length(),
                    mean_anomaly_score: m.mean_anomaly_score(),
                })
                .collect();
        }
        if let Some(q) = params.contamination {
            let values = scores.iter().map(|s| s.anomaly_score).collect::<Vec<_>>();
            model.threshold = Some(quantile(&values, 1. - q));
        }

        info!(
            "Isolation forest trained. ntrees: {}, sample_size: {}, height_limit: {}, mean depth: {:?}.",
            ntrees,
            sample_size,
            height_limit,
            model.tree_stats.depth.mean()
        );
        Ok((model, scores))
    }

    /// Scores rows with the first ntrees trees. Also returns metrics taken after each
    /// checkpoint tree count. checkpoints must be increasing and <= ntrees.
    fn score_rows(
        &self,
        rows: &[&[f64]],
        ntrees: usize,
        checkpoints: &[usize],
        parallel: bool,
    ) -> Result<(Vec<AnomalyScore>, Vec<AnomalyMetrics>), IsoForestError> {
        let trees = &self.trees[..ntrees];
        let score_chunk =
            |chunk: &[&[f64]]| -> Result<(Vec<AnomalyScore>, Vec<AnomalyMetrics>), IsoForestError> {
                let mut scores = Vec::with_capacity(chunk.len());
                let mut metrics = vec![AnomalyMetrics::default(); checkpoints.len()];
                for row in chunk.iter() {
                    let mut agg = ForestAggregator::new(self.sample_size);
                    let mut cp = checkpoints.iter().zip(metrics.iter_mut()).peekable();
                    // Checkpoint 0 means no tree at all.
                    while let Some((_, m)) = cp.next_if(|(k, _)| **k == 0) {
                        m.update(&agg.score());
                    }
                    for (t, tree) in trees.iter().enumerate() {
                        agg.add(tree.path_length(row)?);
                        while let Some((_, m)) = cp.next_if(|(k, _)| **k == t + 1) {
                            m.update(&agg.score());
                        }
                    }
                    scores.push(agg.score());
                }
                Ok((scores, metrics))
            };

        let n_threads = if parallel {
            rayon::current_num_threads().min(rows.len()).max(1)
        } else {
            1
        };
        if n_threads == 1 {
            return score_chunk(rows);
        }

        let chunks = split_offsets(rows.len(), n_threads)
            .into_par_iter()
            .map(|(offset, len)| score_chunk(&rows[offset..offset + len]))
            .collect::<Result<Vec<_>, _>>()?;

        let mut scores = Vec::with_capacity(rows.len());
        let mut metrics = vec![AnomalyMetrics::default(); checkpoints.len()];
        for (s, m) in chunks {
            scores.extend(s);
            for (acc, x) in metrics.iter_mut().zip(m.iter()) {
                acc.merge(x);
            }
        }
        Ok((scores, metrics))
    }

    fn check_dim(&self, data: &ArrayView2<f64>) -> Result<(), IsoForestError> {
        if data.ncols() != self.dim {
            Err(IsoForestError::DimensionMismatch {
                expected: self.dim,
                got: data.ncols(),
            })
        } else {
            Ok(())
        }
    }

    /// Scores rows with the first ntrees trees. ntrees is capped at the forest size, 0 trees
    /// gives mean_length 0 and the degenerate score.
    pub fn score_with_ntrees(
        &self,
        data: ArrayView2<f64>,
        ntrees: usize,
    ) -> Result<Vec<AnomalyScore>, IsoForestError> {
        self.check_dim(&data)?;
        let data = data.as_standard_layout();
        let rows = as_rows(
            data.as_slice().ok_or(IsoForestError::NotContiguous)?,
            self.dim,
        );
        let ntrees = ntrees.min(self.ntrees());
        self.score_rows(&rows, ntrees, &[], self.params.parallel)
            .map(|(scores, _)| scores)
    }

    pub fn score(&self, data: ArrayView2<f64>) -> Result<Vec<AnomalyScore>, IsoForestError> {
        self.score_with_ntrees(data, self.ntrees())
    }

    /// Metrics of the scores of data.
    pub fn metrics(&self, data: ArrayView2<f64>) -> Result<AnomalyMetrics, IsoForestError> {
        let mut metrics = AnomalyMetrics::default();
        for s in self.score(data)?.iter() {
            metrics.update(s);
        }
        Ok(metrics)
    }

    /// True for rows whose score reaches the contamination threshold.
    pub fn predict(&self, data: ArrayView2<f64>) -> Result<Vec<bool>, IsoForestError> {
        let threshold = self.threshold.ok_or(IsoForestError::NoThreshold)?;
        Ok(self
            .score(data)?
            .into_iter()
            .map(|s| s.anomaly_score >= threshold)
            .collect())
    }

    pub fn params(&self) -> &IsolationForestParams {
        &self.params
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rows per tree actually used. Can be less than the requested sample_size.
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn height_limit(&self) -> usize {
        self.height_limit
    }

    pub fn ntrees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[CompressedTree] {
        &self.trees
    }

    pub fn tree_stats(&self) -> &IsolationTreeStats {
        &self.tree_stats
    }

    pub fn variable_splits(&self) -> &VariableSplits {
        &self.variable_splits
    }

    pub fn training_metrics(&self) -> &AnomalyMetrics {
        &self.training_metrics
    }

    pub fn scoring_history(&self) -> &[ScoringHistoryEntry] {
        &self.scoring_history
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn cluster_with_outlier(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut data = Array2::<f64>::zeros((n + 1, 2));
        for i in 0..n {
            data[[i, 0]] = rng.gen_range(0f64..1f64);
            data[[i, 1]] = rng.gen_range(0f64..1f64);
        }
        data[[n, 0]] = 10.;
        data[[n, 1]] = 10.;
        data
    }

    fn params(seed: u64) -> IsolationForestParams {
        IsolationForestParams {
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_outlier_scores_highest() {
        let data = cluster_with_outlier(1000, 0);
        for ext in [0usize, 1] {
            let p = IsolationForestParams {
                extension_level: ext,
                ..params(42)
            };
            let model = IsolationForest::fit(data.view(), &p).unwrap();
            assert_eq!(model.sample_size(), 256);
            assert_eq!(model.height_limit(), 8);
            assert_eq!(model.ntrees(), 100);

            let scores = model.score(data.view()).unwrap();
            let outlier = scores[1000].anomaly_score;
            let cluster_max = scores[..1000]
                .iter()
                .map(|s| s.anomaly_score)
                .fold(f64::MIN, f64::max);
            assert!(outlier > 0.5);
            assert!(outlier > cluster_max);
            for s in scores.iter() {
                assert!(s.anomaly_score > 0. && s.anomaly_score <= 1.);
                assert!(s.mean_length >= 0.);
            }
        }
    }

    #[test]
    fn test_same_seed_same_forest() {
        let data = cluster_with_outlier(300, 1);
        let m1 = IsolationForest::fit(data.view(), &params(7)).unwrap();
        let m2 = IsolationForest::fit(
            data.view(),
            &IsolationForestParams {
                parallel: false,
                ..params(7)
            },
        )
        .unwrap();
        for (t1, t2) in m1.trees().iter().zip(m2.trees().iter()) {
            assert_eq!(t1.as_bytes(), t2.as_bytes());
        }
        assert_eq!(m1.score(data.view()).unwrap(), m2.score(data.view()).unwrap());
        assert_eq!(m1.tree_stats(), m2.tree_stats());

        let m3 = IsolationForest::fit(data.view(), &params(8)).unwrap();
        assert_ne!(m1.trees()[0].as_bytes(), m3.trees()[0].as_bytes());
    }

    #[test]
    fn test_parameter_validation() {
        let data = cluster_with_outlier(50, 2);
        let fit = |p: IsolationForestParams| IsolationForest::fit(data.view(), &p).err();
        assert_eq!(
            fit(IsolationForestParams {
                ntrees: 0,
                ..params(0)
            }),
            Some(IsoForestError::NoTrees)
        );
        assert_eq!(
            fit(IsolationForestParams {
                sample_size: 0,
                ..params(0)
            }),
            Some(IsoForestError::InvalidSampleSize(0))
        );
        assert_eq!(
            fit(IsolationForestParams {
                extension_level: 2,
                ..params(0)
            }),
            Some(IsoForestError::InvalidExtensionLevel { got: 2, max: 1 })
        );
        for k in [0usize, 3] {
            assert_eq!(
                fit(IsolationForestParams {
                    k_planes: Some(k),
                    ..params(0)
                }),
                Some(IsoForestError::InvalidKPlanes { got: k, max: 2 })
            );
        }
        // k_planes does not hide an out of range extension_level
        assert_eq!(
            fit(IsolationForestParams {
                k_planes: Some(1),
                extension_level: 99,
                ..params(0)
            }),
            Some(IsoForestError::InvalidExtensionLevel { got: 99, max: 1 })
        );
        assert_eq!(
            fit(IsolationForestParams {
                k_planes: Some(1),
                extension_level: 1,
                ..params(0)
            }),
            Some(IsoForestError::ConflictingExtension {
                extension_level: 1,
                k_planes: 1
            })
        );
        for (k, ext) in [(2usize, 0usize), (2, 1), (1, 0)] {
            assert_eq!(
                fit(IsolationForestParams {
                    k_planes: Some(k),
                    extension_level: ext,
                    ..params(0)
                }),
                None
            );
        }
        for q in [0., 0.6, -0.1] {
            assert_eq!(
                fit(IsolationForestParams {
                    contamination: Some(q),
                    ..params(0)
                }),
                Some(IsoForestError::InvalidContamination(q))
            );
        }

        let empty = Array2::<f64>::zeros((0, 2));
        assert_eq!(
            IsolationForest::fit(empty.view(), &params(0)).err(),
            Some(IsoForestError::EmptyData)
        );
        let no_columns = Array2::<f64>::zeros((5, 0));
        assert_eq!(
            IsolationForest::fit(no_columns.view(), &params(0)).err(),
            Some(IsoForestError::EmptyData)
        );
        let bad = array![[1., 2.], [f64::NAN, 0.]];
        assert_eq!(
            IsolationForest::fit(bad.view(), &params(0)).err(),
            Some(IsoForestError::NonFiniteValue)
        );
    }

    #[test]
    fn test_k_planes_sets_extension_level() {
        let data = cluster_with_outlier(100, 12);
        let p = IsolationForestParams {
            k_planes: Some(2),
            ntrees: 5,
            ..params(12)
        };
        assert_eq!(p.effective_extension_level(), 1);
        let by_k = IsolationForest::fit(data.view(), &p).unwrap();
        let by_ext = IsolationForest::fit(
            data.view(),
            &IsolationForestParams {
                extension_level: 1,
                ntrees: 5,
                ..params(12)
            },
        )
        .unwrap();
        for (a, b) in by_k.trees().iter().zip(by_ext.trees().iter()) {
            assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }

    #[test]
    fn test_height_limit() {
        let p = IsolationForestParams::default();
        assert_eq!(p.height_limit(256), 8);
        assert_eq!(p.height_limit(257), 9);
        assert_eq!(p.height_limit(1), 0);
        assert_eq!(p.height_limit(3), 2);
        let p = IsolationForestParams {
            max_depth: Some(3),
            ..p
        };
        assert_eq!(p.height_limit(256), 3);
    }

    #[test]
    fn test_single_row_sample_gives_sentinel() {
        let data = cluster_with_outlier(20, 3);
        let p = IsolationForestParams {
            sample_size: 1,
            ntrees: 10,
            ..params(3)
        };
        let model = IsolationForest::fit(data.view(), &p).unwrap();
        assert_eq!(model.height_limit(), 0);
        for s in model.score(data.view()).unwrap() {
            assert_eq!(s.anomaly_score, DEGENERATE_ANOMALY_SCORE);
            assert_eq!(s.mean_length, 0.);
        }

        // One training row: sample_size is clamped to 1
        let one = array![[1., 2.]];
        let model = IsolationForest::fit(one.view(), &params(3)).unwrap();
        assert_eq!(model.sample_size(), 1);
        let s = model.score(data.view()).unwrap();
        assert!(s.iter().all(|s| s.anomaly_score == DEGENERATE_ANOMALY_SCORE));
    }

    #[test]
    fn test_sample_clamped_to_rows() {
        let data = cluster_with_outlier(99, 4);
        let model = IsolationForest::fit(data.view(), &params(4)).unwrap();
        assert_eq!(model.sample_size(), 100);
        assert_eq!(model.height_limit(), 7);
        let isolated = model.tree_stats().isolated_points;
        let not_isolated = model.tree_stats().not_isolated_points;
        assert_abs_diff_eq!(
            isolated.mean().unwrap() + not_isolated.mean().unwrap(),
            100.,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let data = cluster_with_outlier(50, 5);
        let model = IsolationForest::fit(data.view(), &params(5)).unwrap();
        let wrong = array![[1., 2., 3.]];
        assert_eq!(
            model.score(wrong.view()).err(),
            Some(IsoForestError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn test_score_with_ntrees() {
        let data = cluster_with_outlier(200, 6);
        let model = IsolationForest::fit(data.view(), &params(6)).unwrap();
        let none = model.score_with_ntrees(data.view(), 0).unwrap();
        assert!(none
            .iter()
            .all(|s| s.anomaly_score == DEGENERATE_ANOMALY_SCORE && s.mean_length == 0.));
        assert_eq!(
            model.score_with_ntrees(data.view(), 1000).unwrap(),
            model.score(data.view()).unwrap()
        );

        // First tree only: mean length is that tree's path length
        let row = data.row(3).to_vec();
        let first = model.score_with_ntrees(data.view(), 1).unwrap();
        assert_eq!(
            first[3].mean_length,
            model.trees()[0].path_length(&row).unwrap()
        );
    }

    #[test]
    fn test_scoring_history_matches_truncated_forest() {
        let data = cluster_with_outlier(300, 7);
        let p = IsolationForestParams {
            ntrees: 25,
            score_tree_interval: 10,
            ..params(7)
        };
        let model = IsolationForest::fit(data.view(), &p).unwrap();
        let history = model.scoring_history();
        assert_eq!(
            history.iter().map(|h| h.ntrees).collect::<Vec<_>>(),
            vec![0, 10, 20, 25]
        );
        assert_eq!(history[0].mean_length, 0.);
        assert_eq!(history[0].mean_anomaly_score, DEGENERATE_ANOMALY_SCORE);
        for h in history.iter() {
            let scores = model.score_with_ntrees(data.view(), h.ntrees).unwrap();
            let n = scores.len() as f64;
            let mean_length = scores.iter().map(|s| s.mean_length).sum::<f64>() / n;
            let mean_score = scores.iter().map(|s| s.anomaly_score).sum::<f64>() / n;
            assert_abs_diff_eq!(h.mean_length, mean_length, epsilon = 1e-9);
            assert_abs_diff_eq!(h.mean_anomaly_score, mean_score, epsilon = 1e-9);
        }

        let last = history[3];
        let metrics = model.training_metrics();
        assert_abs_diff_eq!(metrics.mean_length(), last.mean_length, epsilon = 1e-12);
        let m = model.metrics(data.view()).unwrap();
        assert_abs_diff_eq!(m.mean_anomaly_score(), metrics.mean_anomaly_score(), epsilon = 1e-9);
        assert_eq!(m.min_path_length(), metrics.min_path_length());
        assert_eq!(m.max_path_length(), metrics.max_path_length());

        let no_history = IsolationForest::fit(data.view(), &params(7)).unwrap();
        assert!(no_history.scoring_history().is_empty());
    }

    #[test]
    fn test_scoring_history_starts_at_zero_trees() {
        let data = cluster_with_outlier(60, 17);
        let p = IsolationForestParams {
            ntrees: 5,
            score_tree_interval: 2,
            ..params(17)
        };
        let model = IsolationForest::fit(data.view(), &p).unwrap();
        assert_eq!(
            model
                .scoring_history()
                .iter()
                .map(|h| h.ntrees)
                .collect::<Vec<_>>(),
            vec![0, 2, 4, 5]
        );

        // Interval larger than the forest: the empty forest and the full one
        let p = IsolationForestParams {
            ntrees: 3,
            score_tree_interval: 10,
            ..params(17)
        };
        let model = IsolationForest::fit(data.view(), &p).unwrap();
        assert_eq!(
            model
                .scoring_history()
                .iter()
                .map(|h| h.ntrees)
                .collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[test]
    fn test_fit_score_returns_training_scores() {
        let data = cluster_with_outlier(150, 19);
        let p = IsolationForestParams {
            ntrees: 20,
            ..params(19)
        };
        let (model, scores) = IsolationForest::fit_score(data.view(), &p).unwrap();
        assert_eq!(scores.len(), 151);
        assert_eq!(scores, model.score(data.view()).unwrap());
        let refit = IsolationForest::fit(data.view(), &p).unwrap();
        assert_eq!(refit.score(data.view()).unwrap(), scores);
    }

    #[test]
    fn test_contamination_threshold() {
        let data = cluster_with_outlier(999, 8);
        let model = IsolationForest::fit(
            data.view(),
            &IsolationForestParams {
                contamination: Some(0.1),
                ..params(8)
            },
        )
        .unwrap();
        let threshold = model.threshold().unwrap();
        let flags = model.predict(data.view()).unwrap();
        let flagged = flags.iter().filter(|b| **b).count();
        assert!((80..=120).contains(&flagged));
        assert!(flags[999]);

        let scores = model.score(data.view()).unwrap();
        for (s, f) in scores.iter().zip(flags.iter()) {
            assert_eq!(*f, s.anomaly_score >= threshold);
        }

        let no_threshold = IsolationForest::fit(data.view(), &params(8)).unwrap();
        assert_eq!(
            no_threshold.predict(data.view()).err(),
            Some(IsoForestError::NoThreshold)
        );
    }

    #[test]
    fn test_quantile() {
        let v = [4., 1., 3., 2., 5.];
        assert_eq!(quantile(&v, 0.5), 3.);
        assert_eq!(quantile(&v, 1.), 5.);
        assert_eq!(quantile(&v, 0.), 1.);
        assert_abs_diff_eq!(quantile(&v, 0.9), 4.6, epsilon = 1e-12);
    }

    #[test]
    fn test_variable_splits() {
        let data = cluster_with_outlier(300, 9);
        let model = IsolationForest::fit(data.view(), &params(9)).unwrap();
        let splits = model.variable_splits();
        // Axis-aligned: every split uses exactly one feature. A binary tree has leaves - 1 splits.
        let n_splits = splits.count().iter().sum::<usize>() as f64;
        let leaves = model.tree_stats().leaves.mean().unwrap() * model.ntrees() as f64;
        assert_abs_diff_eq!(n_splits, leaves - model.ntrees() as f64, epsilon = 1e-6);
        for i in 0..2 {
            assert!(splits.count()[i] > 0);
            assert!(splits.split_ratio()[i] >= 0.);
            assert!(splits.split_ratio()[i] <= splits.count()[i] as f64);
            assert!(splits.depth()[i] >= splits.count()[i]);
        }
    }

    #[test]
    fn test_forest_aggregator() {
        let mut agg = ForestAggregator::new(256);
        assert_eq!(agg.score().anomaly_score, DEGENERATE_ANOMALY_SCORE);
        agg.add(4.);
        agg.add(6.);
        let s = agg.score();
        assert_eq!(agg.ntrees(), 2);
        assert_eq!(s.mean_length, 5.);
        assert_abs_diff_eq!(s.anomaly_score, anomaly_score(5., 256), epsilon = 1e-15);
    }

    #[test]
    fn test_serde_round_trip() {
        let data = cluster_with_outlier(100, 10);
        let model = IsolationForest::fit(
            data.view(),
            &IsolationForestParams {
                ntrees: 10,
                contamination: Some(0.05),
                ..params(10)
            },
        )
        .unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: IsolationForest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ntrees(), 10);
        assert_abs_diff_eq!(
            back.threshold().unwrap(),
            model.threshold().unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(back.score(data.view()).unwrap(), model.score(data.view()).unwrap());

        // Kwargs style: missing fields take defaults
        let p: IsolationForestParams = serde_json::from_str(r#"{"ntrees": 5}"#).unwrap();
        assert_eq!(p.ntrees, 5);
        assert_eq!(p.sample_size, 256);
        assert!(p.parallel);
    }

    #[test]
    fn test_corrupt_tree_rejected_on_load() {
        let data = cluster_with_outlier(50, 11);
        let model = IsolationForest::fit(
            data.view(),
            &IsolationForestParams {
                ntrees: 2,
                ..params(11)
            },
        )
        .unwrap();
        let mut value = serde_json::to_value(&model).unwrap();
        value["trees"][0] = serde_json::json!([1, 0, 0, 0, 1, 0, 0, 0, 9]);
        assert!(serde_json::from_value::<IsolationForest>(value).is_err());
    }
}
