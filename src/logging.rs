//! Tracing setup.
//!
//! Events go to stderr and, when `logging.file` is on, to a per-run file
//! `<logging.directory>/image-converter_YYYYMMDD_HHMMSS.log` without ANSI
//! colors. `RUST_LOG` overrides `logging.level`.
//!
//! The file writer is non-blocking; keep the returned [`WorkerGuard`] alive
//! until the run ends or buffered lines are lost.

use crate::config::LoggingConfig;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("could not create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// File name for a run started at `started`.
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("image-converter_{}.log", started.format("%Y%m%d_%H%M%S"))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns the path of the log file, if one
/// is written, together with the guard that flushes it.
pub fn init(config: &LoggingConfig) -> Result<Option<(PathBuf, WorkerGuard)>, LoggingError> {
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if !config.file {
        tracing_subscriber::registry()
            .with(env_filter(&config.level))
            .with(stderr_layer)
            .try_init()?;
        return Ok(None);
    }

    let (path, writer, guard) = file_writer(&config.directory, Local::now())?;
    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
    Ok(Some((path, guard)))
}

fn file_writer(
    directory: &Path,
    started: DateTime<Local>,
) -> Result<(PathBuf, tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    std::fs::create_dir_all(directory).map_err(|source| LoggingError::Directory {
        path: directory.to_path_buf(),
        source,
    })?;
    let name = log_file_name(started);
    let appender = tracing_appender::rolling::never(directory, &name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((directory.join(name), writer, guard))
}
