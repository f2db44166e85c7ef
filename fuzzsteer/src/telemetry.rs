//! Reading the fuzzer's status record into typed snapshots.
//!
//! The record is the AFL++ `fuzzer_stats` file: one `key : value` assignment
//! per line, rewritten by the fuzzer at its own cadence. Only four keys are
//! recognized; everything else in the file is ignored.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::error::{Malformation, TelemetryError};

pub const KEY_COVERAGE: &str = "bitmap_cvg";
pub const KEY_CORPUS: &str = "corpus_count";
pub const KEY_CRASHES: &str = "saved_crashes";
pub const KEY_THROUGHPUT: &str = "execs_per_sec";

/// Where AFL++ puts the record below its output directory.
pub const AFL_STATS_RELATIVE_PATH: &str = "default/fuzzer_stats";

/// One parsed reading of the telemetry record. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Clamped to `0.0..=100.0`
    pub coverage_pct: f64,
    pub corpus_count: u64,
    pub crash_count: u64,
    pub exec_per_sec: f64,
    pub captured_at: SystemTime,
}

impl Snapshot {
    /// Builds a snapshot from raw values, clamping whatever an untrusted
    /// source could get wrong.
    pub fn new(
        coverage_pct: f64,
        corpus_count: i64,
        crash_count: i64,
        exec_per_sec: f64,
        captured_at: SystemTime,
    ) -> Self {
        Self {
            coverage_pct: coverage_pct.clamp(0.0, 100.0),
            corpus_count: corpus_count.max(0) as u64,
            crash_count: crash_count.max(0) as u64,
            exec_per_sec: exec_per_sec.max(0.0),
            captured_at,
        }
    }
}

/// Anything a controller can poll for snapshots.
pub trait TelemetrySource {
    fn read_snapshot(&self) -> Result<Snapshot, TelemetryError>;

    /// Human readable location, used in log lines.
    fn describe(&self) -> String;
}

type PendingRead = mpsc::Receiver<io::Result<String>>;

/// Reads snapshots from a `fuzzer_stats` file on disk.
///
/// At most one read is in flight per reader. A read that outlives its
/// timeout is picked up again by the next poll instead of starting another.
#[derive(Debug)]
pub struct SnapshotReader {
    path: PathBuf,
    read_timeout: Duration,
    pending: Mutex<Option<PendingRead>>,
}

impl SnapshotReader {
    pub fn new(path: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            read_timeout,
            pending: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The read happens on a helper thread so that a file which never
    /// finishes reading turns into `ReadTimeout` instead of a stuck controller.
    fn read_with_timeout(&self) -> Result<String, TelemetryError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = match pending.take() {
            Some(rx) => rx,
            None => self.spawn_read()?,
        };

        match rx.recv_timeout(self.read_timeout) {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                Err(TelemetryError::Unavailable {
                    path: self.path.clone(),
                })
            }
            Ok(Err(err)) => Err(self.malformed(Malformation::Unreadable(err.to_string()))),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                *pending = Some(rx);
                Err(self.malformed(Malformation::ReadTimeout(self.read_timeout)))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(self.malformed(
                Malformation::Unreadable("reader thread died".to_string()),
            )),
        }
    }

    fn spawn_read(&self) -> Result<PendingRead, TelemetryError> {
        let (tx, rx) = mpsc::channel();
        let path = self.path.clone();

        thread::Builder::new()
            .name("telemetry-read".to_string())
            .spawn(move || {
                // the receiver is gone if the reader was dropped meanwhile
                let _ = tx.send(fs::read_to_string(path));
            })
            .map_err(|err| self.malformed(Malformation::Unreadable(err.to_string())))?;

        Ok(rx)
    }

    fn malformed(&self, cause: Malformation) -> TelemetryError {
        TelemetryError::Malformed {
            path: self.path.clone(),
            cause,
        }
    }
}

impl TelemetrySource for SnapshotReader {
    fn read_snapshot(&self) -> Result<Snapshot, TelemetryError> {
        let content = self.read_with_timeout()?;
        parse_snapshot(&content, SystemTime::now()).map_err(|cause| self.malformed(cause))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Resolves what the operator pointed us at: an AFL++ output directory maps
/// to its `default/fuzzer_stats`, anything else is taken as the record itself.
pub fn resolve_stats_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_dir() {
        path.join(AFL_STATS_RELATIVE_PATH)
    } else {
        path.to_path_buf()
    }
}

/// Parses the content of a status record. All four recognized keys must be
/// present and valid, otherwise no snapshot is produced.
pub fn parse_snapshot(content: &str, captured_at: SystemTime) -> Result<Snapshot, Malformation> {
    let mut coverage = None;
    let mut corpus = None;
    let mut crashes = None;
    let mut throughput = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            KEY_COVERAGE => coverage = Some(value),
            KEY_CORPUS => corpus = Some(value),
            KEY_CRASHES => crashes = Some(value),
            KEY_THROUGHPUT => throughput = Some(value),
            _ => {}
        }
    }

    let coverage = required(KEY_COVERAGE, coverage)?;
    let corpus = required(KEY_CORPUS, corpus)?;
    let crashes = required(KEY_CRASHES, crashes)?;
    let throughput = required(KEY_THROUGHPUT, throughput)?;

    let coverage_pct = parse_finite(KEY_COVERAGE, coverage.trim_end_matches('%').trim_end())?;
    let corpus_count = parse_value::<i64>(KEY_CORPUS, corpus)?;
    let crash_count = parse_value::<i64>(KEY_CRASHES, crashes)?;
    let exec_per_sec = parse_finite(KEY_THROUGHPUT, strip_unit(throughput))?;

    Ok(Snapshot::new(
        coverage_pct,
        corpus_count,
        crash_count,
        exec_per_sec,
        captured_at,
    ))
}

fn required<'a>(key: &'static str, value: Option<&'a str>) -> Result<&'a str, Malformation> {
    value.ok_or(Malformation::MissingKey(key))
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, Malformation> {
    value.parse::<T>().map_err(|_| Malformation::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_finite(key: &'static str, value: &str) -> Result<f64, Malformation> {
    let parsed = parse_value::<f64>(key, value)?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(Malformation::InvalidValue {
            key,
            value: value.to_string(),
        })
    }
}

/// `"1234.56/sec"` and `"1234.56 execs/s"` both become `"1234.56"`.
fn strip_unit(value: &str) -> &str {
    let number = value.split_whitespace().next().unwrap_or(value);
    number.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '/')
}
