use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::strategy::Thresholds;

/// Tunables of a controller, loadable from TOML and overridable from the
/// command line.
///
/// ```toml
/// telemetry = ["out/libpng", "out/libxml2"]
/// poll_interval_secs = 30
/// report_stride = 10
///
/// [thresholds]
/// corpus_growth = 50
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Telemetry records or AFL++ output directories to monitor
    pub telemetry: Vec<PathBuf>,
    pub poll_interval_secs: u64,
    /// Wait after a malformed record, shorter than the poll interval
    pub malformed_backoff_secs: u64,
    /// Upper bound of a random extra delay added to every wait
    pub poll_jitter_secs: f64,
    /// Every n-th decision is shown to the operator
    pub report_stride: u64,
    pub read_timeout_ms: u64,
    pub thresholds: Thresholds,
    pub max_iterations: Option<u64>,
    pub max_duration_secs: Option<u64>,
    /// JSON lines of every surfaced status report
    pub stats_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telemetry: Vec::new(),
            poll_interval_secs: 30,
            malformed_backoff_secs: 5,
            poll_jitter_secs: 0.0,
            report_stride: 5,
            read_timeout_ms: 2000,
            thresholds: Thresholds::default(),
            max_iterations: None,
            max_duration_secs: None,
            stats_file: None,
            log_file: None,
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|reason| ConfigError::Read {
            path: path.to_path_buf(),
            reason,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report_stride == 0 {
            return Err(ConfigError::Invalid(
                "report_stride must be at least 1".to_string(),
            ));
        }
        if Duration::try_from_secs_f64(self.poll_jitter_secs).is_err() {
            return Err(ConfigError::Invalid(format!(
                "poll_jitter_secs must be a non-negative number of seconds, got {}",
                self.poll_jitter_secs
            )));
        }
        self.thresholds.validate().map_err(ConfigError::Invalid)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn malformed_backoff(&self) -> Duration {
        Duration::from_secs(self.malformed_backoff_secs)
    }

    /// Zero when the configured value is not a valid duration.
    pub fn poll_jitter(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_jitter_secs).unwrap_or_default()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}
