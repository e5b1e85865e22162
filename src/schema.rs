//! Canonical feature schema: the ordered feature names a classifier was fit
//! on, together with the z-score parameters of its scaler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};

/// Per-feature standardization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureScale {
    pub mean: f64,
    pub std_dev: f64,
}

impl FeatureScale {
    pub const IDENTITY: FeatureScale = FeatureScale { mean: 0.0, std_dev: 1.0 };

    /// Zero or non-finite deviation leaves the value untouched.
    pub fn apply(&self, value: f64) -> f64 {
        if self.std_dev == 0.0 || !self.std_dev.is_finite() || !self.mean.is_finite() {
            value
        } else {
            (value - self.mean) / self.std_dev
        }
    }
}

/// Scaler parameters as exported next to the model (`scaler.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct CanonicalSchema {
    feature_names: Vec<String>,
    scale: Vec<FeatureScale>,
    index: HashMap<String, usize>,
}

impl CanonicalSchema {
    pub fn new(feature_names: Vec<String>, scale: Vec<FeatureScale>) -> Result<Self> {
        if feature_names.is_empty() {
            return Err(DetectorError::ArtifactLoad("feature list is empty".to_string()));
        }
        if feature_names.len() != scale.len() {
            return Err(DetectorError::ArtifactLoad(format!(
                "feature list has {} names but scaler has {} entries",
                feature_names.len(),
                scale.len()
            )));
        }

        let mut index = HashMap::with_capacity(feature_names.len());
        for (i, name) in feature_names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(DetectorError::ArtifactLoad(format!(
                    "duplicate feature name '{}' in feature list",
                    name
                )));
            }
        }

        Ok(CanonicalSchema {
            feature_names,
            scale,
            index,
        })
    }

    /// Schema with identity scaling, used to align training tables before any
    /// scaler exists.
    pub fn unscaled(feature_names: Vec<String>) -> Result<Self> {
        let scale = vec![FeatureScale::IDENTITY; feature_names.len()];
        Self::new(feature_names, scale)
    }

    pub fn with_scaler(feature_names: Vec<String>, params: &ScalerParams) -> Result<Self> {
        if params.mean.len() != params.scale.len() {
            return Err(DetectorError::ArtifactLoad(format!(
                "scaler mean has {} entries but scale has {}",
                params.mean.len(),
                params.scale.len()
            )));
        }
        let scale = params
            .mean
            .iter()
            .zip(params.scale.iter())
            .map(|(&mean, &std_dev)| FeatureScale { mean, std_dev })
            .collect();
        Self::new(feature_names, scale)
    }

    pub fn len(&self) -> usize {
        self.feature_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_names.is_empty()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn scale(&self) -> &[FeatureScale] {
        &self.scale
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}
