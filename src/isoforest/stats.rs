use super::{IsolationTree, TreeBuildStats};
use serde::{Deserialize, Serialize};

/// Running min, max and mean of one metric. Min and max only exist once something has been
/// recorded, so 0 is a valid minimum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    min: f64,
    max: f64,
    sum: f64,
    count: usize,
}

impl MetricSummary {
    pub fn update(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.sum += x;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &MetricSummary) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Build diagnostics over all trees of a forest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IsolationTreeStats {
    pub isolated_points: MetricSummary,
    pub not_isolated_points: MetricSummary,
    pub zero_splits: MetricSummary,
    pub leaves: MetricSummary,
    pub depth: MetricSummary,
}

impl IsolationTreeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_by(&mut self, tree: &IsolationTree) {
        self.record(tree.stats());
    }

    /// Same as update_by, for when only the tree's build stats are kept around.
    pub fn record(&mut self, stats: &TreeBuildStats) {
        self.isolated_points.update(stats.isolated_points as f64);
        self.not_isolated_points
            .update(stats.not_isolated_points as f64);
        self.zero_splits.update(stats.zero_splits as f64);
        self.leaves.update(stats.leaves as f64);
        self.depth.update(stats.depth as f64);
    }

    pub fn merge(&mut self, other: &IsolationTreeStats) {
        self.isolated_points.merge(&other.isolated_points);
        self.not_isolated_points.merge(&other.not_isolated_points);
        self.zero_splits.merge(&other.zero_splits);
        self.leaves.merge(&other.leaves);
        self.depth.merge(&other.depth);
    }

    pub fn ntrees(&self) -> usize {
        self.depth.count()
    }

    /// (name, summary) pairs, in a fixed order.
    pub fn summaries(&self) -> [(&'static str, &MetricSummary); 5] {
        [
            ("isolated_points", &self.isolated_points),
            ("not_isolated_points", &self.not_isolated_points),
            ("zero_splits", &self.zero_splits),
            ("leaves", &self.leaves),
            ("depth", &self.depth),
        ]
    }
}
