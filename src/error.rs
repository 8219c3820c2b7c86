//! Run-level error taxonomy.
//!
//! | Variant | Scope |
//! |---|---|
//! | `InvalidInput`, `DiscoveryFailed`, `NoFilesFound` | fatal, before any work |
//! | `AuthenticationFailed`, `ConnectionFailed` | fatal for a remote run |
//! | `DecodeFailed`, `EncodeFailed`, `TransferFailed` | one file, logged and counted |
//! | `FilesFailed` | local run finished with failures |
//!
//! Module errors convert into [`RunError`] at the orchestration layer.

use crate::codec::OutputFormat;
use crate::config::ConfigError;
use crate::convert::{ConversionResult, ConvertError};
use crate::discovery::DiscoveryError;
use crate::remote::TransportError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(#[source] DiscoveryError),
    #[error("No matching image files found in {0}")]
    NoFilesFound(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Failed to decode {path}: {message}")]
    DecodeFailed { path: PathBuf, message: String },
    #[error("{format} conversion failed for {path}: {message}")]
    EncodeFailed {
        path: PathBuf,
        format: OutputFormat,
        message: String,
    },
    #[error("Transfer failed for {path}: {source}")]
    TransferFailed {
        path: String,
        #[source]
        source: TransportError,
    },
    #[error("{failed} of {total} files failed, first: {first}")]
    FilesFailed {
        failed: usize,
        total: usize,
        #[source]
        first: Box<RunError>,
    },
    #[error("Could not start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// The file-scoped error for a finished result, if any format failed.
    pub fn from_result(result: &ConversionResult) -> Option<Self> {
        result
            .first_failure()
            .map(|(format, message)| RunError::EncodeFailed {
                path: result.original.clone(),
                format,
                message: message.to_string(),
            })
    }

    /// Fatal errors abort the run before a summary. The rest are scoped to
    /// files, including the aggregate of a run that finished with failures.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RunError::DecodeFailed { .. }
                | RunError::EncodeFailed { .. }
                | RunError::TransferFailed { .. }
                | RunError::FilesFailed { .. }
        )
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::InvalidInput(err.to_string())
    }
}

impl From<ConvertError> for RunError {
    fn from(err: ConvertError) -> Self {
        RunError::DecodeFailed {
            path: err.path().to_path_buf(),
            message: err.cause(),
        }
    }
}

impl From<DiscoveryError> for RunError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::InvalidInput(path) => RunError::InvalidInput(format!(
                "input directory is missing or not a directory: {}",
                path.display()
            )),
            DiscoveryError::NoFilesFound(root) => RunError::NoFilesFound(root),
            other => RunError::DiscoveryFailed(other),
        }
    }
}

impl From<TransportError> for RunError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthenticationFailed(message) => {
                RunError::AuthenticationFailed(message)
            }
            TransportError::ConnectionFailed(message) => RunError::ConnectionFailed(message),
            other => RunError::ConnectionFailed(other.to_string()),
        }
    }
}
