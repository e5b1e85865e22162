//! Runtime configuration shared by the binaries.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Offline,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub mode: Mode,
    pub artifact_dir: PathBuf,
    /// Stored capture, offline only.
    pub pcap: Option<PathBuf>,
    pub output: PathBuf,
    pub max_packets: usize,
    /// Capture interface, live only. `None` picks the first usable one.
    pub interface: Option<String>,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            mode: Mode::Live,
            artifact_dir: PathBuf::from("."),
            pcap: None,
            output: PathBuf::from("predictions.csv"),
            max_packets: 500,
            interface: None,
            poll_interval: Duration::from_millis(200),
            channel_capacity: 4096,
            batch_size: 256,
            workers: num_cpus::get(),
        }
    }
}

impl DetectorConfig {
    /// Reject combinations that cannot start a run. Errors are `UserInput`.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Offline && self.pcap.is_none() {
            return Err(DetectorError::UserInput(
                "please provide --pcap <path> for offline mode".to_string(),
            ));
        }
        if self.max_packets == 0 {
            return Err(DetectorError::UserInput("--max must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(DetectorError::UserInput("--workers must be at least 1".to_string()));
        }
        if self.batch_size == 0 || self.channel_capacity == 0 {
            return Err(DetectorError::UserInput(
                "batch size and channel capacity must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(DetectorError::UserInput("poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.output, PathBuf::from("predictions.csv"));
        assert_eq!(config.max_packets, 500);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_offline_needs_pcap() {
        let config = DetectorConfig {
            mode: Mode::Offline,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DetectorError::UserInput(_)));
        assert!(!err.is_fatal());

        let config = DetectorConfig {
            pcap: Some(PathBuf::from("capture.pcap")),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_rejected() {
        let config = DetectorConfig {
            max_packets: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
