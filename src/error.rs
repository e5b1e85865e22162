use thiserror::Error;

use crate::runtime::RuntimeState;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Artifact load error: {0}")]
    ArtifactLoad(String),

    #[error("Model invocation error: expected {expected} features, got {actual}")]
    ModelInvocation { expected: usize, actual: usize },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Capture read error: {0}")]
    CaptureRead(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Invalid input: {0}")]
    UserInput(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Invalid runtime transition: {from:?} -> {to:?}")]
    InvalidState { from: RuntimeState, to: RuntimeState },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DetectorError {
    /// Structural failures stop a run; everything else is reported and the
    /// process carries on or exits cleanly.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DetectorError::UserInput(_))
    }
}

impl From<pcap_file::PcapError> for DetectorError {
    fn from(err: pcap_file::PcapError) -> Self {
        DetectorError::CaptureRead(err.to_string())
    }
}

impl From<ctrlc::Error> for DetectorError {
    fn from(err: ctrlc::Error) -> Self {
        DetectorError::Capture(format!("failed to install interrupt handler: {}", err))
    }
}

#[cfg(feature = "python")]
impl From<pyo3::PyErr> for DetectorError {
    fn from(err: pyo3::PyErr) -> Self {
        DetectorError::Model(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;
