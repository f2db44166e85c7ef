//! The polling loop that turns telemetry into strategy decisions.
//!
//! Every cycle reads one snapshot, compares it with the [`RunState`], picks a
//! [`StrategyLabel`] and folds the snapshot into a new state. A cycle that
//! fails for whatever reason leaves the state exactly as it was.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, info, warn};
use rand::Rng;

use crate::config::Settings;
use crate::report::{Reporter, RunSummary, StatusReport};
use crate::signal::StopSignal;
use crate::state::RunState;
use crate::strategy::{self, StrategyLabel, StrategyTally, Thresholds};
use crate::error::TelemetryError;
use crate::telemetry::{Snapshot, TelemetrySource};
use crate::trend::{self, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Polling,
    Stopped,
}

/// What a single poll ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Decided(StatusReport),
    /// No telemetry yet, retry after the normal interval
    Unavailable,
    /// Telemetry could not be used, retry after the short backoff
    Malformed,
}

/// Pacing and limits of a controller loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptions {
    pub poll_interval: Duration,
    pub malformed_backoff: Duration,
    pub jitter: Duration,
    pub thresholds: Thresholds,
    pub max_iterations: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        LoopOptions::from(&Settings::default())
    }
}

impl From<&Settings> for LoopOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            malformed_backoff: settings.malformed_backoff(),
            jitter: settings.poll_jitter(),
            thresholds: settings.thresholds,
            max_iterations: settings.max_iterations,
            max_duration: settings.max_duration(),
        }
    }
}

pub struct Controller<S> {
    name: String,
    source: S,
    options: LoopOptions,
    state: RunState,
    phase: Phase,
    strategies: StrategyTally,
    reporter: Reporter,
    started: Instant,
}

impl<S: TelemetrySource> Controller<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        options: LoopOptions,
        reporter: Reporter,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            options,
            state: RunState::new(),
            phase: Phase::Polling,
            strategies: StrategyTally::default(),
            reporter,
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Runs a single read-evaluate-select cycle without waiting.
    pub fn poll_once(&mut self) -> CycleOutcome {
        let thresholds = self.options.thresholds;
        let source = &self.source;
        let state = &self.state;
        let cycle = panic::catch_unwind(AssertUnwindSafe(
            || -> Result<(Snapshot, Trend, StrategyLabel), TelemetryError> {
                let snapshot = source.read_snapshot()?;
                let (trend, strategy) = decide(&snapshot, state, &thresholds);
                Ok((snapshot, trend, strategy))
            },
        ));

        let (snapshot, trend, strategy) = match cycle {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) if err.is_unavailable() => {
                info!("[{}] {}", self.name, err);
                return CycleOutcome::Unavailable;
            }
            Ok(Err(err)) => {
                warn!("[{}] {}", self.name, err);
                return CycleOutcome::Malformed;
            }
            Err(_) => {
                warn!("[{}] cycle panicked, skipping it", self.name);
                return CycleOutcome::Malformed;
            }
        };

        let report = StatusReport {
            controller: self.name.clone(),
            iteration: self.state.iteration,
            snapshot: snapshot.clone(),
            trend,
            strategy,
        };

        self.state = self.state.advance(snapshot, strategy);
        self.strategies.record(strategy);
        self.reporter.emit(report.clone());

        CycleOutcome::Decided(report)
    }

    /// Polls until `stop` is tripped or a configured limit is reached.
    pub fn run(&mut self, stop: &StopSignal) -> RunSummary {
        self.started = Instant::now();
        info!("[{}] Controller started", self.name);
        info!("[{}] Monitoring: {}", self.name, self.source.describe());
        info!(
            "[{}] Started: {}",
            self.name,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        while self.phase == Phase::Polling {
            if stop.is_stopped() {
                self.phase = Phase::Stopped;
                break;
            }

            let delay = match self.poll_once() {
                CycleOutcome::Decided(_) | CycleOutcome::Unavailable => self.options.poll_interval,
                CycleOutcome::Malformed => self.options.malformed_backoff,
            };

            if let Some(reason) = self.limit_reached() {
                info!("[{}] {}", self.name, reason);
                self.phase = Phase::Stopped;
                break;
            }

            if stop.wait(self.capped(self.jittered(delay))) {
                self.phase = Phase::Stopped;
            }
        }

        let summary = self.summary();
        for line in summary.to_string().lines() {
            info!("{}", line);
        }
        summary
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            controller: self.name.clone(),
            iterations: self.state.iteration,
            best_coverage_pct: self.state.best_coverage_pct,
            best_corpus_count: self.state.best_corpus_count,
            total_crashes: self.state.last_crash_count,
            elapsed: self.started.elapsed(),
            strategies: self.strategies.clone(),
        }
    }

    fn limit_reached(&self) -> Option<String> {
        if let Some(max) = self.options.max_iterations {
            if self.state.iteration >= max {
                return Some(format!("Reached {} iterations", max));
            }
        }
        if let Some(max) = self.options.max_duration {
            if self.started.elapsed() >= max {
                return Some(format!("Reached max duration of {:?}", max));
            }
        }
        None
    }

    /// Never sleeps past `max_duration`.
    fn capped(&self, delay: Duration) -> Duration {
        match self.options.max_duration {
            Some(max) => delay.min(max.saturating_sub(self.started.elapsed())),
            None => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.options.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.options.jitter.as_secs_f64());
        let extra = Duration::try_from_secs_f64(extra).unwrap_or(self.options.jitter);
        let delay = delay.saturating_add(extra);
        debug!("[{}] next poll in {:?}", self.name, delay);
        delay
    }
}

/// The pure part of a cycle.
pub fn decide(
    snapshot: &Snapshot,
    state: &RunState,
    thresholds: &Thresholds,
) -> (Trend, StrategyLabel) {
    let trend = trend::evaluate(snapshot, state);
    let strategy = strategy::select(&trend, thresholds);
    (trend, strategy)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::SystemTime;

    use super::*;
    use crate::error::Malformation;

    struct Scripted(RefCell<VecDeque<Result<Snapshot, TelemetryError>>>);

    impl TelemetrySource for Scripted {
        fn read_snapshot(&self) -> Result<Snapshot, TelemetryError> {
            self.0
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(TelemetryError::Unavailable {
                    path: PathBuf::from("scripted"),
                }))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn controller(script: Vec<Result<Snapshot, TelemetryError>>) -> Controller<Scripted> {
        Controller::new(
            "test",
            Scripted(RefCell::new(script.into())),
            LoopOptions {
                poll_interval: Duration::from_millis(1),
                malformed_backoff: Duration::from_millis(1),
                ..LoopOptions::default()
            },
            Reporter::silent(1),
        )
    }

    fn snapshot(
        coverage_pct: f64,
        corpus_count: i64,
        crash_count: i64,
    ) -> Result<Snapshot, TelemetryError> {
        Ok(Snapshot::new(
            coverage_pct,
            corpus_count,
            crash_count,
            10.0,
            SystemTime::now(),
        ))
    }

    #[test_log::test]
    fn test_iteration_is_reported_before_increment() {
        let mut controller = controller(vec![snapshot(1.0, 10, 0), snapshot(1.0, 10, 0)]);

        let CycleOutcome::Decided(first) = controller.poll_once() else {
            panic!("expected a decision");
        };
        assert_eq!(first.iteration, 0);
        assert_eq!(controller.state().iteration, 1);

        let CycleOutcome::Decided(second) = controller.poll_once() else {
            panic!("expected a decision");
        };
        assert_eq!(second.iteration, 1);
    }

    #[test_log::test]
    fn test_failed_cycles_keep_state() {
        let malformed = Err(TelemetryError::Malformed {
            path: PathBuf::from("scripted"),
            cause: Malformation::MissingKey("bitmap_cvg"),
        });
        let mut controller = controller(vec![snapshot(1.0, 10, 0), malformed]);

        controller.poll_once();
        let before = controller.state().clone();

        assert_eq!(controller.poll_once(), CycleOutcome::Malformed);
        assert_eq!(controller.poll_once(), CycleOutcome::Unavailable);
        assert_eq!(controller.state(), &before);
    }

    /// Answers with a snapshot, except for the given call which panics.
    struct PanicsOnCall {
        calls: Cell<u32>,
        panic_on: u32,
    }

    impl TelemetrySource for PanicsOnCall {
        fn read_snapshot(&self) -> Result<Snapshot, TelemetryError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if call == self.panic_on {
                panic!("source exploded on call {}", call);
            }
            snapshot(f64::from(call), 10, 0)
        }

        fn describe(&self) -> String {
            "panicking".to_string()
        }
    }

    #[test_log::test]
    fn test_panicking_cycle_is_skipped() {
        let source = PanicsOnCall {
            calls: Cell::new(0),
            panic_on: 2,
        };
        let mut controller =
            Controller::new("test", source, LoopOptions::default(), Reporter::silent(1));

        assert!(matches!(controller.poll_once(), CycleOutcome::Decided(_)));
        let before = controller.state().clone();

        assert_eq!(controller.poll_once(), CycleOutcome::Malformed);
        assert_eq!(controller.state(), &before);

        let CycleOutcome::Decided(report) = controller.poll_once() else {
            panic!("expected a decision after the panic");
        };
        assert_eq!(report.iteration, 1);
        assert_eq!(controller.state().iteration, 2);
        assert_eq!(controller.state().best_coverage_pct, 3.0);
    }

    #[test_log::test]
    fn test_wait_is_capped_by_max_duration() {
        let mut controller = controller(vec![]);
        controller.options.poll_interval = Duration::from_secs(3600);
        controller.options.max_duration = Some(Duration::from_millis(100));

        let start = Instant::now();
        let summary = controller.run(&StopSignal::new());

        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(summary.elapsed >= Duration::from_millis(100));
        assert_eq!(controller.phase(), Phase::Stopped);
    }

    #[test_log::test]
    fn test_huge_jitter_saturates() {
        let mut controller = controller(vec![]);
        controller.options.jitter = Duration::from_secs(u64::MAX / 2);

        assert_eq!(controller.jittered(Duration::MAX), Duration::MAX);
    }

    #[test_log::test]
    fn test_run_stops_at_max_iterations() {
        let mut controller = controller(vec![
            snapshot(1.0, 10, 0),
            snapshot(1.0, 10, 1),
            snapshot(1.0, 10, 1),
            snapshot(9.0, 10, 1),
        ]);
        controller.options.max_iterations = Some(3);

        let summary = controller.run(&StopSignal::new());

        assert_eq!(controller.phase(), Phase::Stopped);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.total_crashes, 1);
        assert_eq!(summary.strategies.count(StrategyLabel::Exploit), 1);
        assert_eq!(summary.strategies.count(StrategyLabel::Explore), 2);
    }

    #[test_log::test]
    fn test_run_with_stopped_signal_does_not_poll() {
        let mut controller = controller(vec![snapshot(1.0, 10, 0)]);
        let stop = StopSignal::new();
        stop.stop();

        let summary = controller.run(&stop);
        assert_eq!(summary.iterations, 0);
        assert_eq!(controller.state(), &RunState::new());
    }

    #[test_log::test]
    fn test_jitter_stays_in_bounds() {
        let mut controller = controller(vec![]);
        controller.options.jitter = Duration::from_millis(100);

        for _ in 0..50 {
            let delay = controller.jittered(Duration::from_secs(1));
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
