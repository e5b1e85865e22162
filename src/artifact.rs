//! Loading the trained artifact bundle: classifier, scaler parameters and
//! canonical feature list.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::error::{DetectorError, Result};
use crate::model::{ClassifierAdapter, DecisionModel, TreeEnsemble};
use crate::schema::{CanonicalSchema, ScalerParams};

pub const MODEL_JSON: &str = "ddos_model.json";
pub const SCALER_JSON: &str = "scaler.json";
pub const FEATURES_JSON: &str = "feature_list.json";

pub const MODEL_PICKLE: &str = "ddos_model.pkl";
pub const SCALER_PICKLE: &str = "scaler.pkl";
pub const FEATURES_PICKLE: &str = "feature_list.pkl";

/// Classifier and schema, loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub classifier: Arc<ClassifierAdapter>,
    pub schema: Arc<CanonicalSchema>,
}

impl ArtifactBundle {
    /// Pair a model with its schema, refusing a model fit on a different
    /// number of features.
    pub fn assemble(model: Box<dyn DecisionModel>, schema: CanonicalSchema, workers: usize) -> Result<Self> {
        if let Some(n) = model.n_features() {
            if n != schema.len() {
                return Err(DetectorError::ArtifactLoad(format!(
                    "model expects {} features but the feature list has {}",
                    n,
                    schema.len()
                )));
            }
        }
        let classifier = ClassifierAdapter::new(model, schema.len()).with_workers(workers)?;
        Ok(ArtifactBundle {
            classifier: Arc::new(classifier),
            schema: Arc::new(schema),
        })
    }

    /// Load from `dir`. Native JSON exports take precedence over pickles.
    pub fn load(dir: &Path, workers: usize) -> Result<Self> {
        let bundle = if dir.join(MODEL_JSON).exists() {
            Self::load_json(dir, workers)?
        } else if dir.join(MODEL_PICKLE).exists() {
            Self::load_pickles(dir, workers)?
        } else {
            return Err(DetectorError::ArtifactLoad(format!(
                "no {} or {} in {}",
                MODEL_JSON,
                MODEL_PICKLE,
                dir.display()
            )));
        };

        info!(
            "Loaded {} model with {} features: {:?}",
            bundle.classifier.model_name(),
            bundle.schema.len(),
            bundle.schema.feature_names()
        );
        Ok(bundle)
    }

    pub fn load_json(dir: &Path, workers: usize) -> Result<Self> {
        let features: Vec<String> = read_json(&dir.join(FEATURES_JSON))?;
        let scaler: ScalerParams = read_json(&dir.join(SCALER_JSON))?;
        let schema = CanonicalSchema::with_scaler(features, &scaler)?;
        let model = TreeEnsemble::from_path(&dir.join(MODEL_JSON))?;
        Self::assemble(Box::new(model), schema, workers)
    }

    #[cfg(feature = "python")]
    pub fn load_pickles(dir: &Path, workers: usize) -> Result<Self> {
        use crate::model::python;

        let features = python::load_feature_list(&dir.join(FEATURES_PICKLE))?;
        let scaler = python::load_scaler(&dir.join(SCALER_PICKLE))?;
        let schema = CanonicalSchema::with_scaler(features, &scaler)?;
        let model = python::PythonModel::load(&dir.join(MODEL_PICKLE))?;
        Self::assemble(Box::new(model), schema, workers)
    }

    #[cfg(not(feature = "python"))]
    pub fn load_pickles(dir: &Path, _workers: usize) -> Result<Self> {
        Err(DetectorError::ArtifactLoad(format!(
            "{} holds joblib artifacts; rebuild with the `python` feature or export {}",
            dir.display(),
            MODEL_JSON
        )))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| DetectorError::ArtifactLoad(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| DetectorError::ArtifactLoad(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_bundle(dir: &Path, features: &str, scaler: &str, model: &str) {
        fs::write(dir.join(FEATURES_JSON), features).unwrap();
        fs::write(dir.join(SCALER_JSON), scaler).unwrap();
        fs::write(dir.join(MODEL_JSON), model).unwrap();
    }

    const MODEL: &str = r#"{"n_features": 2, "classes": [0, 1], "trees": [{"nodes": [
        {"feature": 0, "threshold": 0.0, "left": 1, "right": 2}, {"value": [1, 0]}, {"value": [0, 1]}]}]}"#;

    #[test]
    fn test_load_native_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            r#"["frame.len", "ip.proto"]"#,
            r#"{"mean": [100.0, 6.0], "scale": [50.0, 1.0]}"#,
            MODEL,
        );

        let bundle = ArtifactBundle::load(dir.path(), 1).unwrap();
        assert_eq!(bundle.schema.len(), 2);
        assert_eq!(bundle.classifier.feature_count(), 2);
        assert_eq!(bundle.schema.scale()[0].mean, 100.0);
    }

    #[test]
    fn test_model_width_must_match_schema() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            r#"["a", "b", "c"]"#,
            r#"{"mean": [0, 0, 0], "scale": [1, 1, 1]}"#,
            MODEL,
        );
        let err = ArtifactBundle::load(dir.path(), 1).unwrap_err();
        assert!(matches!(err, DetectorError::ArtifactLoad(_)));
    }

    #[test]
    fn test_missing_artifacts_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ArtifactBundle::load(dir.path(), 1),
            Err(DetectorError::ArtifactLoad(_))
        ));
    }

    #[test]
    fn test_corrupt_feature_list() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "[1, 2", r#"{"mean": [], "scale": []}"#, MODEL);
        let err = ArtifactBundle::load(dir.path(), 1).unwrap_err();
        assert!(err.to_string().contains(FEATURES_JSON));
    }
}
