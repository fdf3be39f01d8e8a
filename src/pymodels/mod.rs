pub mod py_iforest;

use crate::isoforest::IsoForestError;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

impl From<IsoForestError> for PyErr {
    fn from(value: IsoForestError) -> Self {
        PyValueError::new_err(value.to_string())
    }
}
