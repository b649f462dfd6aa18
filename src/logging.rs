//! log4rs setup, either from a log4rs yaml file or a console logger at a fixed level.
use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {t} - {l} - {m}{n}";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingParameters {
    /// Level of the console logger. Ignored if `config_file` is set.
    #[serde(default = "default_level")]
    pub level: String,
    /// Optional log4rs yaml configuration.
    #[serde(default)]
    pub config_file: Option<PathBuf>,
}

impl Default for LoggingParameters {
    fn default() -> Self {
        LoggingParameters { level: default_level(), config_file: None }
    }
}

fn default_level() -> String {
    String::from("info")
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("unknown log level \'{0}\'")]
    Level(String),
    #[error("could not create logger from yaml configuration: {0}")]
    File(String),
    #[error("invalid logger configuration: {0}")]
    Config(String),
    #[error("logger already initialized: {0}")]
    Init(#[from] log::SetLoggerError),
}

pub fn level_filter(level: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(level.trim()).map_err(|_| LoggingError::Level(level.to_string()))
}

fn console_config(level: LevelFilter) -> Result<Config, LoggingError> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .map_err(|err| LoggingError::Config(err.to_string()))
}

pub fn init(params: &LoggingParameters) -> Result<(), LoggingError> {
    match &params.config_file {
        Some(path) => log4rs::init_file(path, Default::default())
            .map_err(|err| LoggingError::File(err.to_string())),
        None => {
            let config = console_config(level_filter(&params.level)?)?;
            log4rs::init_config(config)?;
            Ok(())
        }
    }
}
