#![allow(non_snake_case)]
use crate::isoforest::{AnomalyScore, IsoForestError, IsolationForest, IsolationForestParams};
use numpy::{PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::exceptions::PyIndexError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

#[pyclass(subclass)]
pub struct PyIsolationForest {
    model: IsolationForest,
}

fn unzip_scores(scores: Vec<AnomalyScore>) -> (Vec<f64>, Vec<f64>) {
    scores
        .into_iter()
        .map(|s| (s.anomaly_score, s.mean_length))
        .unzip()
}

#[pymethods]
impl PyIsolationForest {
    /// Fits the forest on X.
    #[new]
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature=(
        X,
        ntrees = 100,
        sample_size = 256,
        extension_level = 0,
        k_planes = None,
        max_depth = None,
        seed = None,
        contamination = None,
        score_tree_interval = 0,
        parallel = true,
    ))]
    pub fn new(
        X: PyReadonlyArray2<f64>,
        ntrees: usize,
        sample_size: usize,
        extension_level: usize,
        k_planes: Option<usize>,
        max_depth: Option<usize>,
        seed: Option<u64>,
        contamination: Option<f64>,
        score_tree_interval: usize,
        parallel: bool,
    ) -> PyResult<Self> {
        if !X.is_c_contiguous() {
            return Err(IsoForestError::NotContiguous.into());
        }
        let params = IsolationForestParams {
            ntrees,
            sample_size,
            extension_level,
            k_planes,
            max_depth,
            seed,
            contamination,
            score_tree_interval,
            parallel,
        };
        let model = IsolationForest::fit(X.as_array(), &params)?;
        Ok(PyIsolationForest { model })
    }

    /// Returns (anomaly_score, mean_length)
    pub fn score(&self, X: PyReadonlyArray2<f64>) -> PyResult<(Vec<f64>, Vec<f64>)> {
        let scores = self.model.score(X.as_array())?;
        Ok(unzip_scores(scores))
    }

    pub fn score_with_ntrees(
        &self,
        X: PyReadonlyArray2<f64>,
        ntrees: usize,
    ) -> PyResult<(Vec<f64>, Vec<f64>)> {
        let scores = self.model.score_with_ntrees(X.as_array(), ntrees)?;
        Ok(unzip_scores(scores))
    }

    pub fn predict(&self, X: PyReadonlyArray2<f64>) -> PyResult<Vec<bool>> {
        Ok(self.model.predict(X.as_array())?)
    }

    #[getter]
    pub fn ntrees(&self) -> usize {
        self.model.ntrees()
    }

    #[getter]
    pub fn sample_size(&self) -> usize {
        self.model.sample_size()
    }

    #[getter]
    pub fn threshold(&self) -> Option<f64> {
        self.model.threshold()
    }

    /// Packed bytes of the i-th tree.
    pub fn tree_bytes<'py>(&self, py: Python<'py>, i: usize) -> PyResult<Bound<'py, PyBytes>> {
        match self.model.trees().get(i) {
            Some(tree) => Ok(PyBytes::new_bound(py, tree.as_bytes())),
            None => Err(PyIndexError::new_err(format!(
                "Tree index {} is out of range for {} trees.",
                i,
                self.model.ntrees()
            ))),
        }
    }

    /// (metric, min, max, mean) of the tree build statistics.
    pub fn tree_stats(&self) -> Vec<(String, Option<f64>, Option<f64>, Option<f64>)> {
        self.model
            .tree_stats()
            .summaries()
            .into_iter()
            .map(|(name, m)| (name.to_string(), m.min(), m.max(), m.mean()))
            .collect()
    }

    /// (count, split_ratio, depth) per feature.
    pub fn variable_splits(&self) -> (Vec<usize>, Vec<f64>, Vec<usize>) {
        let splits = self.model.variable_splits();
        (
            splits.count().to_vec(),
            splits.split_ratio().to_vec(),
            splits.depth().to_vec(),
        )
    }

    /// (ntrees, mean_length, mean_anomaly_score) per entry.
    pub fn scoring_history(&self) -> Vec<(usize, f64, f64)> {
        self.model
            .scoring_history()
            .iter()
            .map(|h| (h.ntrees, h.mean_length, h.mean_anomaly_score))
            .collect()
    }
}
