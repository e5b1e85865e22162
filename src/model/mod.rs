//! Classifier adapter around the opaque trained model.

pub mod forest;
#[cfg(feature = "python")]
pub mod python;

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::reconcile::FeatureVector;

pub use forest::TreeEnsemble;

/// Batches smaller than this are scored on the calling thread.
const PARALLEL_BATCH_MIN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Normal,
    Attack,
}

impl Label {
    /// Training encodes benign traffic as 0 and attack traffic as 1.
    pub fn from_class(class: i64) -> Self {
        if class == 1 {
            Label::Attack
        } else {
            Label::Normal
        }
    }

    pub fn is_attack(&self) -> bool {
        matches!(self, Label::Attack)
    }

    /// Wording used in the offline prediction table.
    pub fn table_name(&self) -> &'static str {
        match self {
            Label::Normal => "Normal",
            Label::Attack => "DDoS",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Normal => write!(f, "Normal"),
            Label::Attack => write!(f, "DDoS Attack"),
        }
    }
}

/// A trained decision function over scaled feature vectors.
pub trait DecisionModel: Send + Sync {
    /// Number of input features the model was fit on, when it records it.
    fn n_features(&self) -> Option<usize>;

    fn predict(&self, features: &[f64]) -> Result<Label>;

    /// Rows are already validated against the schema length.
    fn predict_many(&self, rows: &[&[f64]]) -> Result<Vec<Label>> {
        rows.iter().map(|row| self.predict(row)).collect()
    }

    /// Prior probability of the attack class, for explainability tooling.
    fn base_value(&self) -> Option<f64> {
        None
    }

    fn name(&self) -> &str;
}

pub struct ClassifierAdapter {
    model: Box<dyn DecisionModel>,
    feature_count: usize,
    pool: Option<rayon::ThreadPool>,
}

impl ClassifierAdapter {
    pub fn new(model: Box<dyn DecisionModel>, feature_count: usize) -> Self {
        ClassifierAdapter {
            model,
            feature_count,
            pool: None,
        }
    }

    /// Score batches on a dedicated pool of `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("vajra-score-{}", i))
            .build()
            .map_err(|e| DetectorError::Model(format!("failed to build scoring pool: {}", e)))?;
        self.pool = Some(pool);
        Ok(self)
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn base_value(&self) -> Option<f64> {
        self.model.base_value()
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.feature_count {
            return Err(DetectorError::ModelInvocation {
                expected: self.feature_count,
                actual,
            });
        }
        Ok(())
    }

    pub fn predict(&self, vector: &[f64]) -> Result<Label> {
        self.check_len(vector.len())?;
        self.model.predict(vector)
    }

    /// Labels come back in input order.
    pub fn predict_batch(&self, vectors: &[FeatureVector]) -> Result<Vec<Label>> {
        for vector in vectors {
            self.check_len(vector.len())?;
        }
        let rows: Vec<&[f64]> = vectors.iter().map(|v| v.as_slice()).collect();

        if rows.len() < PARALLEL_BATCH_MIN {
            return self.model.predict_many(&rows);
        }

        let score = || -> Result<Vec<Label>> {
            let chunk = (rows.len() / rayon::current_num_threads().max(1)).max(PARALLEL_BATCH_MIN);
            let parts: Vec<Vec<Label>> = rows
                .par_chunks(chunk)
                .map(|part| self.model.predict_many(part))
                .collect::<Result<_>>()?;
            Ok(parts.into_iter().flatten().collect())
        };

        match &self.pool {
            Some(pool) => pool.install(score),
            None => score(),
        }
    }
}

impl fmt::Debug for ClassifierAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierAdapter")
            .field("model", &self.model.name())
            .field("feature_count", &self.feature_count)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_models {
    use super::*;

    /// Flags a vector as an attack when the feature at `index` exceeds
    /// `threshold`.
    pub struct ThresholdModel {
        pub index: usize,
        pub threshold: f64,
        pub n_features: usize,
    }

    impl DecisionModel for ThresholdModel {
        fn n_features(&self) -> Option<usize> {
            Some(self.n_features)
        }

        fn predict(&self, features: &[f64]) -> Result<Label> {
            let value = features.get(self.index).copied().unwrap_or(0.0);
            Ok(if value > self.threshold { Label::Attack } else { Label::Normal })
        }

        fn name(&self) -> &str {
            "threshold"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_models::ThresholdModel;
    use super::*;
    use crate::features::RawFeatureMap;
    use crate::reconcile::Reconciler;
    use crate::schema::CanonicalSchema;
    use std::sync::Arc;

    fn adapter(n: usize) -> ClassifierAdapter {
        ClassifierAdapter::new(
            Box::new(ThresholdModel { index: 0, threshold: 100.0, n_features: n }),
            n,
        )
    }

    #[test]
    fn test_length_mismatch_is_invocation_error() {
        let adapter = adapter(5);
        let err = adapter.predict(&[1.0, 2.0, 3.0, 4.0]).unwrap_err();
        match err {
            DetectorError::ModelInvocation { expected, actual } => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let names: Vec<String> = vec!["x".into(), "y".into()];
        let reconciler = Reconciler::new(Arc::new(CanonicalSchema::unscaled(names).unwrap()));
        let vectors: Vec<FeatureVector> = (0..500)
            .map(|i| {
                let mut raw = RawFeatureMap::new();
                raw.insert("x", if i % 3 == 0 { 500.0 } else { 1.0 });
                reconciler.reconcile(&raw)
            })
            .collect();

        let adapter = adapter(2).with_workers(4).unwrap();
        let labels = adapter.predict_batch(&vectors).unwrap();
        assert_eq!(labels.len(), 500);
        for (i, label) in labels.iter().enumerate() {
            assert_eq!(label.is_attack(), i % 3 == 0, "row {}", i);
        }
    }

    #[test]
    fn test_batch_rejects_any_bad_row() {
        let names: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
        let reconciler = Reconciler::new(Arc::new(CanonicalSchema::unscaled(names).unwrap()));
        let vectors = vec![reconciler.reconcile(&RawFeatureMap::new())];
        assert!(matches!(
            adapter(2).predict_batch(&vectors),
            Err(DetectorError::ModelInvocation { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_label_wording() {
        assert_eq!(Label::Attack.to_string(), "DDoS Attack");
        assert_eq!(Label::Attack.table_name(), "DDoS");
        assert_eq!(Label::Normal.table_name(), "Normal");
        assert_eq!(Label::from_class(1), Label::Attack);
        assert_eq!(Label::from_class(0), Label::Normal);
    }
}
