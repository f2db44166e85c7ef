//! Status reports of a controller and the sinks they are surfaced to.

use std::fmt::{self, Display};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::strategy::{StrategyLabel, StrategyTally};
use crate::telemetry::Snapshot;
use crate::trend::Trend;

/// The outcome of one successful poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub controller: String,
    pub iteration: u64,
    pub snapshot: Snapshot,
    pub trend: Trend,
    pub strategy: StrategyLabel,
}

impl Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{:04}] Cov: {:>6.2}% | Corpus: {:>5} | Crashes: {:>3} | Speed: {:>8.1}/s | Strategy: {:>7}",
            self.controller,
            self.iteration,
            self.snapshot.coverage_pct,
            self.snapshot.corpus_count,
            self.snapshot.crash_count,
            self.snapshot.exec_per_sec,
            self.strategy,
        )
    }
}

pub trait ReportHandler: Send {
    fn process(&mut self, report: &StatusReport);
}

impl<F> ReportHandler for F
where
    F: FnMut(&StatusReport) + Send,
{
    fn process(&mut self, report: &StatusReport) {
        self(report)
    }
}

/// Appends every report it receives as one JSON object per line.
pub struct JsonLinesHandler {
    writer: BufWriter<File>,
}

impl JsonLinesHandler {
    pub fn new(output_path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(output_path.as_ref())?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, report: &StatusReport) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl ReportHandler for JsonLinesHandler {
    fn process(&mut self, report: &StatusReport) {
        if let Err(err) = self.write(report) {
            warn!("Failed to write status report: {}", err);
        }
    }
}

/// Keeps the latest report and forwards every `stride`-th one to its handlers.
pub struct Reporter {
    stride: u64,
    latest: Option<StatusReport>,
    handlers: Vec<Box<dyn ReportHandler>>,
}

impl Reporter {
    /// A reporter that logs surfaced reports at info level.
    pub fn new(stride: u64) -> Self {
        let log_line: Box<dyn ReportHandler> =
            Box::new(|report: &StatusReport| info!("{}", report));

        Self {
            stride: stride.max(1),
            latest: None,
            handlers: vec![log_line],
        }
    }

    /// A reporter without any handler attached.
    pub fn silent(stride: u64) -> Self {
        Self {
            stride: stride.max(1),
            latest: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl ReportHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn latest(&self) -> Option<&StatusReport> {
        self.latest.as_ref()
    }

    pub fn emit(&mut self, report: StatusReport) {
        if report.iteration % self.stride == 0 {
            for handler in &mut self.handlers {
                handler.process(&report);
            }
        } else {
            debug!("{}", report);
        }
        self.latest = Some(report);
    }
}

/// What a controller prints once it stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub controller: String,
    pub iterations: u64,
    pub best_coverage_pct: f64,
    pub best_corpus_count: u64,
    pub total_crashes: u64,
    pub elapsed: Duration,
    pub strategies: StrategyTally,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Controller {} stopped", self.controller)?;
        writeln!(f, "  Total iterations: {}", self.iterations)?;
        writeln!(f, "  Best coverage: {:.2}%", self.best_coverage_pct)?;
        writeln!(f, "  Best corpus: {}", self.best_corpus_count)?;
        writeln!(f, "  Total crashes: {}", self.total_crashes)?;
        writeln!(f, "  Elapsed: {:.1}s", self.elapsed.as_secs_f64())?;
        write!(f, "  Strategies: {}", self.strategies)
    }
}
