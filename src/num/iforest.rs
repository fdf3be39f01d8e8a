/// Fits an extended isolation forest on the feature columns and scores every row of them.
use crate::{
    isoforest::{IsoForestError, IsolationForest, IsolationForestParams},
    utils::series_to_ndarray,
};
use polars::prelude::*;
use pyo3_polars::{
    derive::{polars_expr, CallerContext},
    export::polars_core::POOL,
};

impl From<IsoForestError> for PolarsError {
    fn from(value: IsoForestError) -> Self {
        PolarsError::ComputeError(value.to_string().into())
    }
}

pub fn iforest_output(_: &[Field]) -> PolarsResult<Field> {
    let score = Field::new("anomaly_score", DataType::Float64);
    let length = Field::new("mean_length", DataType::Float64);
    let v = vec![score, length];
    Ok(Field::new("iforest", DataType::Struct(v)))
}

#[polars_expr(output_type_func=iforest_output)]
fn pl_isolation_forest(
    inputs: &[Series],
    context: CallerContext,
    kwargs: IsolationForestParams,
) -> PolarsResult<Series> {
    let can_parallel = kwargs.parallel && !context.parallel();
    let params = IsolationForestParams {
        parallel: can_parallel,
        ..kwargs
    };

    // Nulls become NaN here, which fit rejects.
    let data = series_to_ndarray(inputs, IndexOrder::C)?;
    // Training rows are the rows being scored, and fitting already scores them.
    let fit_and_score = || IsolationForest::fit_score(data.view(), &params).map(|(_, s)| s);
    let scores = if can_parallel {
        POOL.install(fit_and_score)
    } else {
        fit_and_score()
    }?;

    let (score, length): (Vec<f64>, Vec<f64>) = scores
        .into_iter()
        .map(|s| (s.anomaly_score, s.mean_length))
        .unzip();
    let ca_score = Float64Chunked::from_vec("anomaly_score", score).into_series();
    let ca_length = Float64Chunked::from_vec("mean_length", length).into_series();
    let out = StructChunked::new("iforest", &[ca_score, ca_length])?;
    Ok(out.into_series())
}
