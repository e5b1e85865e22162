//! Schema reconciliation.
//!
//! Every raw feature map, whether it came from a captured packet or from a
//! row of a training table, goes through [`Reconciler::reconcile`] to become
//! a [`FeatureVector`] in canonical order. Absent or non-numeric values are
//! filled with zero; names the schema does not know are dropped.

use std::sync::Arc;

use log::{debug, trace};

use crate::features::RawFeatureMap;
use crate::schema::CanonicalSchema;

/// Fixed-length vector in the schema's feature order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl AsRef<[f64]> for FeatureVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// What had to be defaulted or discarded while reconciling one map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub missing: Vec<String>,
    pub malformed: Vec<String>,
    pub dropped: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty() && self.dropped == 0
    }
}

/// How training-time alignment treats a table or row without a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingLabelPolicy {
    /// Refuse the table or row (fail closed).
    #[default]
    Reject,
    /// Treat the missing label as benign traffic (fail open).
    DefaultBenign,
}

impl std::str::FromStr for MissingLabelPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" | "fail-closed" => Ok(MissingLabelPolicy::Reject),
            "benign" | "default-benign" | "fail-open" => Ok(MissingLabelPolicy::DefaultBenign),
            other => Err(format!("unknown missing-label policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    schema: Arc<CanonicalSchema>,
}

impl Reconciler {
    pub fn new(schema: Arc<CanonicalSchema>) -> Self {
        Reconciler { schema }
    }

    pub fn schema(&self) -> &CanonicalSchema {
        &self.schema
    }

    pub fn reconcile(&self, raw: &RawFeatureMap) -> FeatureVector {
        self.reconcile_with_report(raw).0
    }

    pub fn reconcile_with_report(&self, raw: &RawFeatureMap) -> (FeatureVector, ReconcileReport) {
        let (mut values, report) = self.align(raw);
        for (value, scale) in values.iter_mut().zip(self.schema.scale()) {
            *value = scale.apply(*value);
        }
        (FeatureVector(values), report)
    }

    /// Reorder, coerce and zero-fill without scaling.
    fn align(&self, raw: &RawFeatureMap) -> (Vec<f64>, ReconcileReport) {
        let mut report = ReconcileReport::default();
        let mut values = Vec::with_capacity(self.schema.len());

        for name in self.schema.feature_names() {
            let value = match raw.get(name) {
                Some(v) => match v.as_f64() {
                    Some(n) => n,
                    None => {
                        debug!("Feature '{}' is not numeric ({:?}), using 0", name, v);
                        report.malformed.push(name.clone());
                        0.0
                    }
                },
                None => {
                    trace!("Feature '{}' absent, using 0", name);
                    report.missing.push(name.clone());
                    0.0
                }
            };
            values.push(value);
        }

        report.dropped = raw.names().filter(|n| !self.schema.contains(n)).count();
        (values, report)
    }
}
