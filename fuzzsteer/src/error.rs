use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::From;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    Telemetry(TelemetryError),
    Config(ConfigError),
    /// Unexpected IO failure outside of telemetry reads, e.g. opening the stats sink
    IO(io::Error),
    /// log4rs refused the generated configuration
    Logging(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Telemetry(err) => write!(f, "{}", err),
            Error::Config(err) => write!(f, "invalid configuration: {}", err),
            Error::IO(err) => write!(f, "io error: {}", err),
            Error::Logging(err) => write!(f, "failed to set up logging: {}", err),
        }
    }
}

/// Failure to turn the telemetry record into a snapshot.
///
/// Neither variant is fatal to a controller: `Unavailable` is retried at the
/// normal cadence, `Malformed` at the short backoff.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// The record does not exist (yet). Expected while the fuzzer starts up.
    Unavailable { path: PathBuf },
    /// The record exists but could not be turned into a complete snapshot.
    Malformed { path: PathBuf, cause: Malformation },
}

impl TelemetryError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TelemetryError::Unavailable { .. })
    }

    /// The recognized key that caused the failure, if the failure came from a key.
    pub fn offending_key(&self) -> Option<&'static str> {
        match self {
            TelemetryError::Malformed { cause, .. } => cause.key(),
            TelemetryError::Unavailable { .. } => None,
        }
    }
}

impl std::error::Error for TelemetryError {}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::Unavailable { path } => {
                write!(f, "telemetry not available yet at {}", path.display())
            }
            TelemetryError::Malformed { path, cause } => {
                write!(f, "malformed telemetry in {}: {}", path.display(), cause)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Malformation {
    MissingKey(&'static str),
    InvalidValue { key: &'static str, value: String },
    /// The read did not complete within the configured timeout
    ReadTimeout(Duration),
    /// The file exists but reading it failed (permissions, invalid UTF-8, ...)
    Unreadable(String),
}

impl Malformation {
    pub fn key(&self) -> Option<&'static str> {
        match self {
            Malformation::MissingKey(key) | Malformation::InvalidValue { key, .. } => Some(*key),
            Malformation::ReadTimeout(_) | Malformation::Unreadable(_) => None,
        }
    }
}

impl fmt::Display for Malformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformation::MissingKey(key) => write!(f, "missing key `{}`", key),
            Malformation::InvalidValue { key, value } => {
                write!(f, "cannot parse `{}` value {:?}", key, value)
            }
            Malformation::ReadTimeout(timeout) => {
                write!(f, "read did not complete within {:?}", timeout)
            }
            Malformation::Unreadable(reason) => write!(f, "unreadable: {}", reason),
        }
    }
}

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    Read { path: PathBuf, reason: io::Error },
    Parse(toml::de::Error),
    #[from(ignore)]
    Invalid(String),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, reason } => {
                write!(f, "cannot read {}: {}", path.display(), reason)
            }
            ConfigError::Parse(err) => write!(f, "{}", err),
            ConfigError::Invalid(reason) => write!(f, "{}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_offending_key_is_carried() {
        let err = TelemetryError::Malformed {
            path: PathBuf::from("fuzzer_stats"),
            cause: Malformation::InvalidValue {
                key: "bitmap_cvg",
                value: "abc%".to_string(),
            },
        };

        assert_eq!(err.offending_key(), Some("bitmap_cvg"));
        assert!(!err.is_unavailable());
        assert!(err.to_string().contains("bitmap_cvg"));
    }

    #[test_log::test]
    fn test_timeout_has_no_key() {
        let err = TelemetryError::Malformed {
            path: PathBuf::from("fuzzer_stats"),
            cause: Malformation::ReadTimeout(Duration::from_millis(10)),
        };
        assert_eq!(err.offending_key(), None);
    }
}
