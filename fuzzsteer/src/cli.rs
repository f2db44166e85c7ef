use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use clap::{arg, crate_name, crate_version, value_parser, ArgAction, ArgMatches, Command};
use log::{error, info, warn};

use crate::config::Settings;
use crate::controller::{Controller, LoopOptions};
use crate::error::{ConfigError, Error};
use crate::report::{JsonLinesHandler, ReportHandler, Reporter, RunSummary, StatusReport};
use crate::signal::StopSignal;
use crate::telemetry::{resolve_stats_path, SnapshotReader, AFL_STATS_RELATIVE_PATH};

fn create_app() -> Command {
    Command::new(crate_name!())
        .version(crate::MAYBE_GIT_REF.unwrap_or(crate_version!()))
        .about("Watches fuzzer telemetry and selects a fuzzing strategy from its trend")
        .arg(arg!([telemetry] "fuzzer_stats files or AFL++ output directories to monitor")
            .num_args(0..)
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(-c --config [file] "TOML file with controller settings")
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(-n --name [name] "Target name, one per telemetry path in order")
            .action(ArgAction::Append))
        .arg(arg!(-i --interval [secs] "Seconds between two polls")
            .value_parser(value_parser!(u64)))
        .arg(arg!(-b --backoff [secs] "Seconds to wait after malformed telemetry")
            .value_parser(value_parser!(u64)))
        .arg(arg!(-j --jitter [secs] "Upper bound of a random delay added to every wait")
            .value_parser(value_parser!(f64)))
        .arg(arg!(-s --stride [n] "Show every n-th decision")
            .value_parser(value_parser!(u64).range(1..)))
        .arg(arg!(--"read-timeout" [ms] "Milliseconds a telemetry read may take")
            .value_parser(value_parser!(u64)))
        .arg(arg!(--"coverage-gain" [pct] "Coverage gain in percentage points that keeps exploring")
            .value_parser(value_parser!(f64)))
        .arg(arg!(--"corpus-growth" [n] "New corpus entries per poll that switch to hybrid")
            .value_parser(value_parser!(i64)))
        .arg(arg!(--"deep-coverage" [pct] "Coverage above which a plateau goes deep")
            .value_parser(value_parser!(f64)))
        .arg(arg!(--"deep-corpus" [n] "Corpus size above which a plateau goes deep")
            .value_parser(value_parser!(u64)))
        .arg(arg!(--"max-iters" [n] "Stop after this many decisions")
            .value_parser(value_parser!(u64)))
        .arg(arg!(--"max-duration" [secs] "Stop after this many seconds")
            .value_parser(value_parser!(u64)))
        .arg(arg!(--"stats-file" [file] "Append surfaced status reports as JSON lines")
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(--"log-file" [file] "Also write the log to this file")
            .value_parser(value_parser!(PathBuf)))
}

pub fn main() -> ExitCode {
    let matches = create_app().get_matches();
    let settings = settings_from(&matches);

    let log_file = settings.as_ref().ok().and_then(|s| s.log_file.clone());
    let _handle = match crate::log::init(log_file.as_deref()) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let settings = match settings {
        Ok(settings) => settings,
        Err(err) => {
            error!("{}", Error::from(err));
            return ExitCode::FAILURE;
        }
    };

    if settings.telemetry.is_empty() {
        error!("No telemetry to monitor, pass a fuzzer_stats file or an AFL++ output directory");
        return ExitCode::FAILURE;
    }

    let names: Vec<String> = matches
        .get_many::<String>("name")
        .map(|names| names.cloned().collect())
        .unwrap_or_default();

    let stop = StopSignal::new();
    if let Err(err) = stop.stop_on_termination() {
        error!("Failed to install signal handler: {}", err);
        return ExitCode::FAILURE;
    }

    match run(&settings, &names, &stop) {
        Ok(summaries) => {
            info!("{} controller(s) finished", summaries.len());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

/// Runs one controller per telemetry path, each on its own thread, until
/// `stop` is tripped or every controller hit its limits.
pub fn run(
    settings: &Settings,
    names: &[String],
    stop: &StopSignal,
) -> Result<Vec<RunSummary>, Error> {
    let stats_sink = match &settings.stats_file {
        Some(path) => Some(Arc::new(Mutex::new(JsonLinesHandler::new(path)?))),
        None => None,
    };

    let options = LoopOptions::from(settings);

    thread::scope(|scope| {
        let workers: Vec<_> = settings
            .telemetry
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let stats_path = resolve_stats_path(path);
                let name = names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| target_name(&stats_path));

                let mut reporter = Reporter::new(settings.report_stride);
                if let Some(sink) = &stats_sink {
                    let sink = Arc::clone(sink);
                    reporter = reporter.with_handler(move |report: &StatusReport| {
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .process(report)
                    });
                }

                let source = SnapshotReader::new(stats_path, settings.read_timeout());
                let mut controller = Controller::new(name, source, options.clone(), reporter);

                scope.spawn(move || controller.run(stop))
            })
            .collect();

        let mut summaries = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.join() {
                Ok(summary) => summaries.push(summary),
                Err(_) => warn!("A controller thread panicked"),
            }
        }
        Ok(summaries)
    })
}

fn settings_from(matches: &ArgMatches) -> Result<Settings, ConfigError> {
    let mut settings = match matches.get_one::<PathBuf>("config") {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    if let Some(paths) = matches.get_many::<PathBuf>("telemetry") {
        settings.telemetry.extend(paths.cloned());
    }
    if let Some(secs) = matches.get_one::<u64>("interval") {
        settings.poll_interval_secs = *secs;
    }
    if let Some(secs) = matches.get_one::<u64>("backoff") {
        settings.malformed_backoff_secs = *secs;
    }
    if let Some(secs) = matches.get_one::<f64>("jitter") {
        settings.poll_jitter_secs = *secs;
    }
    if let Some(stride) = matches.get_one::<u64>("stride") {
        settings.report_stride = *stride;
    }
    if let Some(ms) = matches.get_one::<u64>("read-timeout") {
        settings.read_timeout_ms = *ms;
    }
    if let Some(pct) = matches.get_one::<f64>("coverage-gain") {
        settings.thresholds.coverage_gain_pct = *pct;
    }
    if let Some(n) = matches.get_one::<i64>("corpus-growth") {
        settings.thresholds.corpus_growth = *n;
    }
    if let Some(pct) = matches.get_one::<f64>("deep-coverage") {
        settings.thresholds.deep_coverage_pct = *pct;
    }
    if let Some(n) = matches.get_one::<u64>("deep-corpus") {
        settings.thresholds.deep_corpus_count = *n;
    }
    if let Some(n) = matches.get_one::<u64>("max-iters") {
        settings.max_iterations = Some(*n);
    }
    if let Some(secs) = matches.get_one::<u64>("max-duration") {
        settings.max_duration_secs = Some(*secs);
    }
    if let Some(path) = matches.get_one::<PathBuf>("stats-file") {
        settings.stats_file = Some(path.clone());
    }
    if let Some(path) = matches.get_one::<PathBuf>("log-file") {
        settings.log_file = Some(path.clone());
    }

    settings.validate()?;
    Ok(settings)
}

/// `out/libpng/default/fuzzer_stats` is called `libpng`.
fn target_name(stats_path: &Path) -> String {
    let skipped: Vec<&str> = AFL_STATS_RELATIVE_PATH.split('/').collect();

    stats_path
        .ancestors()
        .filter_map(|ancestor| ancestor.file_name())
        .map(|name| name.to_string_lossy())
        .find(|name| {
            let name: &str = name;
            !skipped.contains(&name)
        })
        .map(|name| name.into_owned())
        .unwrap_or_else(|| "fuzzer".to_string())
}
