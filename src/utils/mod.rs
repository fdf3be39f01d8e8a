#[cfg(feature = "python")]
use ndarray::Array2;
#[cfg(feature = "python")]
use polars::{
    datatypes::Float64Type,
    error::{PolarsError, PolarsResult},
    frame::DataFrame,
    prelude::IndexOrder,
    series::Series,
};

// -------------------------------------------------------------------------------
// Common, Resuable Functions
// -------------------------------------------------------------------------------

#[cfg(feature = "python")]
#[inline(always)]
pub fn series_to_ndarray(inputs: &[Series], order: IndexOrder) -> PolarsResult<Array2<f64>> {
    let df = DataFrame::new(inputs.to_vec())?;
    if df.is_empty() {
        Err(PolarsError::ComputeError("Empty data.".into()))
    } else {
        df.to_ndarray::<Float64Type>(order)
    }
}

/// Splits 0..len into n (offset, len) pieces. The last piece takes the remainder.
pub fn split_offsets(len: usize, n: usize) -> Vec<(usize, usize)> {
    if n <= 1 {
        vec![(0, len)]
    } else {
        let chunk_size = len / n;
        (0..n)
            .map(|partition| {
                let offset = partition * chunk_size;
                let len = if partition == (n - 1) {
                    len - offset
                } else {
                    chunk_size
                };
                (offset, len)
            })
            .collect()
    }
}
