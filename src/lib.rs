//! Packet-level DDoS classification.
//!
//! Packets are reduced to a handful of header fields, aligned onto the
//! feature order the classifier was trained with, and labelled either from a
//! live interface or from a stored capture.

pub mod artifact;
pub mod capture;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod model;
pub mod output;
pub mod reconcile;
pub mod runtime;
pub mod schema;

pub use artifact::ArtifactBundle;
pub use config::{DetectorConfig, Mode};
pub use error::{DetectorError, Result};
pub use features::{extract_features, Extraction, RawFeatureMap};
pub use model::{ClassifierAdapter, DecisionModel, Label};
pub use output::{ClassificationResult, ConsoleSink, ResultSink, ResultTable};
pub use reconcile::{FeatureVector, MissingLabelPolicy, Reconciler};
pub use runtime::{DetectionRuntime, RunSummary, RuntimeState, StopHandle};
pub use schema::CanonicalSchema;
