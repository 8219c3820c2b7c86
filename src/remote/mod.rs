//! Remote mode: convert images that live on an SSH host.
//!
//! | Module | Role |
//! |--------|------|
//! | [`transport`] | Reconnecting transport over the [`Connector`] / [`RemoteSession`] seam |
//! | [`ssh`] | `ssh2` implementation of that seam (SSH exec + SFTP) |
//! | [`batch`] | Batch orchestration: download, convert, upload, clean up |
//!
//! All network work runs sequentially over one session. Remote runs trade
//! throughput for a single stable connection.

pub mod batch;
pub mod ssh;
pub mod transport;

pub use batch::{BatchOrchestrator, RemoteReport, RunPhase, run_remote};
pub use ssh::SshConnector;
pub use transport::{Connector, RemoteSession, RemoteTransport, TransportError, UploadCheck};
