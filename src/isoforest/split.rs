use super::{goes_left, project, IsoForestError};
use rand::{seq::index, Rng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// A random hyperplane: every point x with (x - intercept) . normal < 0 lies on the left.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitCriteria {
    pub normal: Vec<f64>,
    pub intercept: Vec<f64>,
}

impl SplitCriteria {
    pub fn dim(&self) -> usize {
        self.normal.len()
    }

    #[inline]
    pub fn project(&self, row: &[f64]) -> f64 {
        project(
            row,
            self.normal.iter().copied(),
            self.intercept.iter().copied(),
        )
    }

    #[inline]
    pub fn goes_left(&self, row: &[f64]) -> bool {
        goes_left(self.project(row))
    }

    /// Indices of the dimensions the hyperplane actually cuts.
    pub fn active_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.normal
            .iter()
            .enumerate()
            .filter(|(_, n)| **n != 0.)
            .map(|(i, _)| i)
    }
}

/// Draws split criteria for a node. Holds no randomness of its own; the caller threads
/// the tree's rng through every call.
#[derive(Clone, Copy, Debug)]
pub struct SplitGenerator {
    dim: usize,
    extension_level: usize,
}

impl SplitGenerator {
    pub fn new(dim: usize, extension_level: usize) -> Result<Self, IsoForestError> {
        if dim == 0 {
            return Err(IsoForestError::EmptyData);
        }
        if extension_level > dim - 1 {
            return Err(IsoForestError::InvalidExtensionLevel {
                got: extension_level,
                max: dim - 1,
            });
        }
        Ok(SplitGenerator {
            dim,
            extension_level,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn extension_level(&self) -> usize {
        self.extension_level
    }

    /// Min and max of every column over the subset. Vec of length 2 * dim, mins first.
    fn find_bounds(rows: &[&[f64]], dim: usize) -> Vec<f64> {
        let mut bounds = vec![f64::MAX; dim];
        bounds.extend(std::iter::repeat(f64::MIN).take(dim));
        for row in rows.iter() {
            for (i, x) in row.iter().copied().enumerate() {
                bounds[i] = bounds[i].min(x);
                bounds[dim + i] = bounds[dim + i].max(x);
            }
        }
        bounds
    }

    /// Random normal with extension_level + 1 non-zero coordinates and a random intercept
    /// inside the bounding box of rows. rows must not be empty.
    pub fn generate<R: Rng>(&self, rows: &[&[f64]], rng: &mut R) -> SplitCriteria {
        let dim = self.dim;
        let mut normal = (0..dim)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect::<Vec<_>>();

        let n_zeros = dim.saturating_sub(self.extension_level + 1);
        if n_zeros > 0 {
            for i in index::sample(rng, dim, n_zeros).into_iter() {
                normal[i] = 0.;
            }
        }

        // One uniform draw per dimension, even for constant columns, so the stream
        // consumed per node only depends on dim.
        let bounds = Self::find_bounds(rows, dim);
        let intercept = (0..dim)
            .map(|i| {
                let (lo, hi) = (bounds[i], bounds[dim + i]);
                let u: f64 = rng.gen();
                if hi > lo {
                    lo + u * (hi - lo)
                } else {
                    lo
                }
            })
            .collect::<Vec<_>>();

        SplitCriteria { normal, intercept }
    }
}
