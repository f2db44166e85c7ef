use std::env;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;

use crate::error::{Error, Result};

const STDERR_PATTERN: &str = "{h({d(%Y-%m-%dT%H:%M:%S%Z)}\t{m}{n})}";
const FILE_PATTERN: &str = "{d}\t{l}\t{m}{n}";

/// Logs to stderr and, when `log_file` is given, additionally to that file.
pub fn config(log_file: Option<&Path>) -> Result<Config> {
    let mut builder = Config::builder().appender(appender_stderr("stderr"));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        builder = builder.appender(appender_tofile("tofile", path)?);
        root = root.appender("tofile");
    }

    builder
        .build(root.build(log_level()))
        .map_err(|err| Error::Logging(err.to_string()))
}

pub fn init(log_file: Option<&Path>) -> Result<log4rs::Handle> {
    log4rs::init_config(config(log_file)?).map_err(|err| Error::Logging(err.to_string()))
}

fn appender_stderr(name: &str) -> Appender {
    Appender::builder().build(
        name,
        Box::new(
            ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(STDERR_PATTERN)))
                .build(),
        ),
    )
}

fn appender_tofile(name: &str, log_path: &Path) -> Result<Appender> {
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(log_path)?;

    Ok(Appender::builder().build(name, Box::new(file)))
}

fn log_level() -> LevelFilter {
    env::var("RUST_LOG")
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_stderr_only_config() {
        let config = config(None).unwrap();
        assert_eq!(config.appenders().len(), 1);
    }

    #[test_log::test]
    fn test_file_config_adds_appender() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(Some(&dir.path().join("fuzzsteer.log"))).unwrap();
        assert_eq!(config.appenders().len(), 2);
        assert_eq!(config.root().appenders(), ["stderr", "tofile"]);
    }
}
