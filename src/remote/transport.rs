//! Reconnecting remote transport.
//!
//! [`RemoteTransport`] owns at most one live [`RemoteSession`]. A session
//! bundles the command channel and the file-transfer channel, so the two are
//! always open together and are torn down and rebuilt as a pair.
//!
//! Every public operation follows the same linear shape:
//!
//! ```text
//! with_retry(policy) {
//!     ensure connected        (reconnect if the session was torn down)
//!     attempt step            (open / create / mkdir / exec)
//!     connection error?  →  reconnect once, attempt the step once more
//!     copy bytes              (connection error tears the session down)
//! }
//! ```
//!
//! Anything still failing is handed to the outer retry loop.

use crate::retry::{self, RetryError, RetryPolicy, Sleeper, ThreadSleeper};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("remote command `{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },
    #[error("{operation} {path}: {message}")]
    Remote {
        operation: &'static str,
        path: String,
        message: String,
    },
    #[error("local file {path} is not uploadable: {reason}")]
    InvalidLocalFile { path: PathBuf, reason: String },
    #[error("local IO error on {path}: {source}")]
    Local { path: PathBuf, source: io::Error },
    #[error("reconnect after `{original}` failed: {source}")]
    ReconnectFailed {
        original: String,
        #[source]
        source: Box<TransportError>,
    },
    #[error(transparent)]
    Exhausted(#[from] RetryError<Box<TransportError>>),
}

impl TransportError {
    /// Whether this looks like a dropped connection. Only the transport's own
    /// message is inspected, never the path or command it concerns.
    pub fn is_connection_error(&self) -> bool {
        match self {
            TransportError::ConnectionFailed(_) => true,
            TransportError::Remote { message, .. } => retry::is_connection_error(message),
            TransportError::ReconnectFailed { source, .. } => source.is_connection_error(),
            TransportError::Exhausted(err) => err.source.is_connection_error(),
            TransportError::AuthenticationFailed(_)
            | TransportError::CommandFailed { .. }
            | TransportError::InvalidLocalFile { .. }
            | TransportError::Local { .. } => false,
        }
    }

    fn local(path: &Path, source: io::Error) -> Self {
        TransportError::Local {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One live connection: command execution plus file transfer.
pub trait RemoteSession {
    /// Run a command and return its exit status with combined output.
    fn exec(&mut self, command: &str) -> Result<(i32, String), TransportError>;

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read>, TransportError>;

    /// Create or truncate a remote file.
    fn create_write(&mut self, path: &str) -> Result<Box<dyn Write>, TransportError>;

    fn mkdir_all(&mut self, path: &str) -> Result<(), TransportError>;

    /// Best-effort shutdown of both channels. Errors are ignored.
    fn close(&mut self);
}

/// Builds sessions from fixed connection parameters.
pub trait Connector {
    type Session: RemoteSession;

    fn connect(&self) -> Result<Self::Session, TransportError>;

    /// `user@host:port`, for logs.
    fn describe(&self) -> String;
}

/// Checks a local file before it is uploaded.
pub trait UploadCheck {
    /// Returns the file size when the file may be uploaded.
    fn check(&self, path: &Path) -> Result<u64, String>;
}

/// Parent of a `/`-separated remote path, if any.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

pub struct RemoteTransport<C: Connector> {
    connector: C,
    session: Option<C::Session>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    reconnects: u64,
}

impl<C: Connector> RemoteTransport<C> {
    /// Open the first session. Failure here is fatal for the run.
    pub fn connect(connector: C, policy: RetryPolicy) -> Result<Self, TransportError> {
        let session = connector.connect()?;
        info!(remote = %connector.describe(), "connected");
        Ok(Self {
            connector,
            session: Some(session),
            policy,
            sleeper: Arc::new(ThreadSleeper),
            reconnects: 0,
        })
    }

    /// Replace the backoff sleeper (tests record instead of sleeping).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Successful reconnects since the transport was created.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Drop the current session (if any) and build a fresh one.
    pub fn reconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut old) = self.session.take() {
            old.close();
        }
        let session = self.connector.connect()?;
        self.session = Some(session);
        self.reconnects += 1;
        info!(
            remote = %self.connector.describe(),
            reconnects = self.reconnects,
            "reconnected"
        );
        Ok(())
    }

    /// Graceful shutdown. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            debug!(remote = %self.connector.describe(), "connection closed");
        }
    }

    /// Run a remote command; non-zero exit is an error carrying the output.
    pub fn execute(&mut self, command: &str) -> Result<String, TransportError> {
        self.retrying(|transport| {
            let (status, output) = transport.step("exec", |s| s.exec(command))?;
            if status != 0 {
                return Err(TransportError::CommandFailed {
                    command: command.to_string(),
                    status,
                    output,
                });
            }
            Ok(output)
        })
    }

    /// Copy a remote file to `local`, creating local parent directories.
    ///
    /// A failed copy never leaves a partial local file behind.
    pub fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        self.retrying(|transport| {
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).map_err(|e| TransportError::local(parent, e))?;
            }
            let mut reader = transport.step("open", |s| s.open_read(remote))?;
            let mut file = File::create(local).map_err(|e| TransportError::local(local, e))?;
            let copied = io::copy(&mut reader, &mut file).and_then(|n| file.flush().map(|_| n));
            match copied {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    drop(file);
                    if let Err(remove) = fs::remove_file(local) {
                        warn!(path = %local.display(), error = %remove, "could not remove partial download");
                    }
                    Err(transport.copy_failed("download", remote, e))
                }
            }
        })
    }

    /// Copy `local` to `remote`, creating remote parent directories.
    ///
    /// The local file is checked first; a file that fails the check is not
    /// retried.
    pub fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        check: &dyn UploadCheck,
    ) -> Result<u64, TransportError> {
        check
            .check(local)
            .map_err(|reason| TransportError::InvalidLocalFile {
                path: local.to_path_buf(),
                reason,
            })?;

        self.retrying(|transport| {
            if let Some(parent) = remote_parent(remote) {
                transport.step("mkdir", |s| s.mkdir_all(parent))?;
            }
            let mut file = File::open(local).map_err(|e| TransportError::local(local, e))?;
            let mut writer = transport.step("create", |s| s.create_write(remote))?;
            match io::copy(&mut file, &mut writer).and_then(|n| writer.flush().map(|_| n)) {
                Ok(bytes) => Ok(bytes),
                Err(e) => Err(transport.copy_failed("upload", remote, e)),
            }
        })
    }

    /// Outer retry loop shared by every operation.
    fn retrying<T>(
        &mut self,
        mut attempt: impl FnMut(&mut Self) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let policy = self.policy;
        let sleeper = Arc::clone(&self.sleeper);
        retry::with_retry(&policy, sleeper.as_ref(), |_| {
            attempt(self).map_err(Box::new)
        })
        .map_err(TransportError::from)
    }

    /// Run one session step: ensure connected, attempt, and on a connection
    /// error reconnect once and attempt again.
    fn step<T>(
        &mut self,
        operation: &'static str,
        mut op: impl FnMut(&mut C::Session) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let first = op(self.ensure_connected()?);
        match first {
            Err(err) if err.is_connection_error() => {
                warn!(operation, error = %err, "connection error, reconnecting");
                self.reconnect()
                    .map_err(|source| TransportError::ReconnectFailed {
                        original: err.to_string(),
                        source: Box::new(source),
                    })?;
                op(self.ensure_connected()?)
            }
            other => other,
        }
    }

    fn ensure_connected(&mut self) -> Result<&mut C::Session, TransportError> {
        if self.session.is_none() {
            debug!("session torn down, reconnecting before attempt");
            self.reconnect()?;
        }
        self.session
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionFailed("no session after reconnect".into()))
    }

    /// Convert a copy failure. A dropped connection tears the session down
    /// so the next attempt starts with a reconnect.
    fn copy_failed(&mut self, operation: &'static str, path: &str, err: io::Error) -> TransportError {
        let error = TransportError::Remote {
            operation,
            path: path.to_string(),
            message: err.to_string(),
        };
        if error.is_connection_error() {
            if let Some(mut session) = self.session.take() {
                session.close();
            }
        }
        error
    }
}

impl<C: Connector> Drop for RemoteTransport<C> {
    fn drop(&mut self) {
        self.close();
    }
}
