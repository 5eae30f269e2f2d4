//! Tracing setup: console output filtered by `LOGLEVEL`, and everything at
//! debug level into the rotatable process log file.

use bench_core::{Config, LogFile};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs the global subscriber and returns the log file handle the
/// orchestrator rotates after each job.
///
/// With `console_to_stderr` the console layer leaves stdout to JSON output.
pub fn init(config: &Config, console_to_stderr: bool) -> Result<LogFile, LoggingError> {
    let log_file = LogFile::open(&config.log_file).map_err(|source| LoggingError::OpenLogFile {
        path: config.log_file.clone(),
        source,
    })?;

    let console = if console_to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console_layer = fmt::layer()
        .with_writer(console)
        .with_filter(build_env_filter(&config.log_level));
    let file_writer = log_file.clone();
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(move || file_writer.clone())
        .with_filter(LevelFilter::DEBUG);

    let subscriber = Registry::default().with(console_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("logging initialized; log file at {}", log_file.path().display());
    Ok(log_file)
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
