//! joblib-pickled estimators, called through an embedded Python interpreter.
//!
//! Only built with the `python` feature. The interpreter needs `joblib`,
//! `numpy` and the estimator's own package (scikit-learn) importable.

use std::path::Path;

use ndarray::Array2;
use numpy::{IntoPyArray, PyReadonlyArray1};
use pyo3::prelude::*;

use super::{DecisionModel, Label};
use crate::error::{DetectorError, Result};
use crate::schema::ScalerParams;

pub struct PythonModel {
    model: PyObject,
    n_features: Option<usize>,
}

fn load_error(path: &Path, err: PyErr) -> DetectorError {
    DetectorError::ArtifactLoad(format!("cannot load {}: {}", path.display(), err))
}

fn joblib_load<'py>(py: Python<'py>, path: &Path) -> Result<Bound<'py, PyAny>> {
    let joblib = py.import("joblib").map_err(|e| load_error(path, e))?;
    joblib
        .call_method1("load", (path.to_string_lossy().to_string(),))
        .map_err(|e| load_error(path, e))
}

impl PythonModel {
    pub fn load(path: &Path) -> Result<Self> {
        Python::with_gil(|py| {
            let model = joblib_load(py, path)?;
            // Estimators fit on arrays record their input width
            let n_features = model
                .getattr("n_features_in_")
                .and_then(|n| n.extract::<usize>())
                .ok();
            Ok(PythonModel {
                model: model.unbind(),
                n_features,
            })
        })
    }

    fn predict_matrix(&self, rows: &[&[f64]]) -> Result<Vec<Label>> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let matrix = Array2::from_shape_vec((rows.len(), width), flat)
            .map_err(|e| DetectorError::Model(format!("bad feature matrix: {}", e)))?;

        Python::with_gil(|py| {
            let prediction = self
                .model
                .call_method1(py, "predict", (matrix.into_pyarray(py),))?;
            let classes: Vec<i64> = match prediction.extract::<Vec<i64>>(py) {
                Ok(classes) => classes,
                Err(_) => prediction
                    .extract::<Vec<f64>>(py)?
                    .into_iter()
                    .map(|c| c.round() as i64)
                    .collect(),
            };
            Ok(classes.into_iter().map(Label::from_class).collect())
        })
    }
}

impl DecisionModel for PythonModel {
    fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    fn predict(&self, features: &[f64]) -> Result<Label> {
        let labels = self.predict_matrix(&[features])?;
        labels
            .into_iter()
            .next()
            .ok_or_else(|| DetectorError::Model("model returned no prediction".to_string()))
    }

    fn predict_many(&self, rows: &[&[f64]]) -> Result<Vec<Label>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let labels = self.predict_matrix(rows)?;
        if labels.len() != rows.len() {
            return Err(DetectorError::Model(format!(
                "model returned {} predictions for {} rows",
                labels.len(),
                rows.len()
            )));
        }
        Ok(labels)
    }

    fn name(&self) -> &str {
        "joblib"
    }
}

/// Read `mean_` and `scale_` from a pickled StandardScaler.
pub fn load_scaler(path: &Path) -> Result<ScalerParams> {
    Python::with_gil(|py| {
        let scaler = joblib_load(py, path)?;
        let read = |attr: &str| -> Result<Vec<f64>> {
            let array: PyReadonlyArray1<f64> = scaler
                .getattr(attr)
                .and_then(|a| a.extract())
                .map_err(|e| load_error(path, e))?;
            Ok(array.as_array().to_vec())
        };
        Ok(ScalerParams {
            mean: read("mean_")?,
            scale: read("scale_")?,
        })
    })
}

/// Read the pickled feature-name list.
pub fn load_feature_list(path: &Path) -> Result<Vec<String>> {
    Python::with_gil(|py| {
        let list = joblib_load(py, path)?;
        list.extract::<Vec<String>>().map_err(|e| load_error(path, e))
    })
}
