pub mod isoforest;
pub mod utils;

#[cfg(feature = "python")]
mod num;
#[cfg(feature = "python")]
mod pymodels;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(all(feature = "python", target_os = "linux"))]
use jemallocator::Jemalloc;

#[global_allocator]
#[cfg(all(feature = "python", target_os = "linux"))]
static ALLOC: Jemalloc = Jemalloc;

#[cfg(feature = "python")]
#[pymodule]
#[pyo3(name = "_polars_iforest")]
fn _polars_iforest(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<pymodels::py_iforest::PyIsolationForest>()?;
    Ok(())
}
