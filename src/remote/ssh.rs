//! SSH/SFTP sessions over `ssh2` (libssh2).
//!
//! ## Authentication
//!
//! | `use_ssh_agent` | `key_path` | Method |
//! |---|---|---|
//! | true | any | agent at `SSH_AUTH_SOCK` (error when unset) |
//! | false | set | private key file (`~` and `$VAR` expanded) |
//! | false | unset | `AuthenticationFailed` |
//!
//! ## Host keys
//!
//! When the configured `known_hosts` file can be read, the server key must be
//! listed there. When it cannot be read, any host key is accepted and a
//! warning is logged. That fallback is insecure and only suited to trusted
//! networks.

use super::transport::{Connector, RemoteSession, TransportError};
use crate::config::RemoteConfig;
use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How to prove our identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Agent reachable at this socket.
    Agent(String),
    KeyFile(PathBuf),
}

/// Decide the auth method from config and the agent socket variable.
pub fn resolve_auth(
    config: &RemoteConfig,
    agent_socket: Option<String>,
) -> Result<AuthMethod, TransportError> {
    if config.use_ssh_agent {
        return match agent_socket.filter(|s| !s.is_empty()) {
            Some(socket) => Ok(AuthMethod::Agent(socket)),
            None => Err(TransportError::AuthenticationFailed(
                "use_ssh_agent is set but SSH_AUTH_SOCK is not".into(),
            )),
        };
    }
    match config.expanded_key_path() {
        Some(path) => Ok(AuthMethod::KeyFile(path)),
        None => Err(TransportError::AuthenticationFailed(
            "no authentication method configured (enable use_ssh_agent or set key_path)".into(),
        )),
    }
}

/// Connection parameters captured at startup and reused for every reconnect.
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    user: String,
    auth: AuthMethod,
    known_hosts: Option<PathBuf>,
    timeout: Duration,
}

impl SshConnector {
    pub fn from_config(config: &RemoteConfig) -> Result<Self, TransportError> {
        let auth = resolve_auth(config, std::env::var("SSH_AUTH_SOCK").ok())?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            auth,
            known_hosts: config.expanded_known_hosts(),
            timeout: config.timeout(),
        })
    }

    fn open_tcp(&self) -> Result<TcpStream, TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionFailed(format!("resolving {}: {e}", self.host)))?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(format!("{addr}: {e}")),
            }
        }
        Err(TransportError::ConnectionFailed(last_error.unwrap_or_else(|| {
            format!("{} resolved to no addresses", self.host)
        })))
    }

    fn verify_host_key(&self, session: &Session) -> Result<(), TransportError> {
        let Some(path) = &self.known_hosts else {
            warn!(host = %self.host, "no known_hosts configured, accepting any host key");
            return Ok(());
        };
        let mut known = session.known_hosts().map_err(connection_failed)?;
        if let Err(e) = known.read_file(path, KnownHostFileKind::OpenSSH) {
            warn!(
                path = %path.display(),
                error = %e,
                "known_hosts unreadable, accepting any host key"
            );
            return Ok(());
        }
        let (key, _) = session
            .host_key()
            .ok_or_else(|| TransportError::ConnectionFailed("server sent no host key".into()))?;
        match known.check_port(&self.host, self.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(TransportError::ConnectionFailed(format!(
                "host key for {} not found in {}",
                self.host,
                path.display()
            ))),
            CheckResult::Mismatch => Err(TransportError::ConnectionFailed(format!(
                "host key for {} does NOT match {}",
                self.host,
                path.display()
            ))),
            CheckResult::Failure => Err(TransportError::ConnectionFailed(
                "host key check failed".into(),
            )),
        }
    }

    fn authenticate(&self, session: &Session) -> Result<(), TransportError> {
        let result = match &self.auth {
            AuthMethod::Agent(_) => session.userauth_agent(&self.user),
            AuthMethod::KeyFile(path) => session.userauth_pubkey_file(&self.user, None, path, None),
        };
        if let Err(e) = result {
            return Err(TransportError::AuthenticationFailed(format!(
                "{} as {}: {e}",
                self.host, self.user
            )));
        }
        if !session.authenticated() {
            return Err(TransportError::AuthenticationFailed(format!(
                "{} rejected {}",
                self.host, self.user
            )));
        }
        Ok(())
    }
}

fn connection_failed(e: ssh2::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn sftp_error(operation: &'static str, path: &str, e: ssh2::Error) -> TransportError {
    TransportError::Remote {
        operation,
        path: path.to_string(),
        message: e.to_string(),
    }
}

/// Drain a command's merged stdout and stderr. Output that is not UTF-8 is
/// decoded lossily so one odd file name cannot fail a whole listing.
fn read_exec_output(command: &str, mut stream: impl Read) -> Result<String, TransportError> {
    let mut raw = Vec::new();
    if let Err(e) = stream.read_to_end(&mut raw) {
        warn!(command, error = %e, "reading command output failed");
        return Err(TransportError::Remote {
            operation: "exec",
            path: command.to_string(),
            message: e.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self) -> Result<SshSession, TransportError> {
        let tcp = self.open_tcp()?;
        let mut session = Session::new().map_err(connection_failed)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(connection_failed)?;

        self.verify_host_key(&session)?;
        self.authenticate(&session)?;

        let sftp = session.sftp().map_err(connection_failed)?;
        debug!(remote = %self.describe(), "SSH and SFTP channels open");
        Ok(SshSession {
            session,
            sftp: Some(sftp),
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Command session plus SFTP subsystem on one TCP connection.
pub struct SshSession {
    session: Session,
    sftp: Option<Sftp>,
}

impl SshSession {
    fn sftp(&self, operation: &'static str, path: &str) -> Result<&Sftp, TransportError> {
        self.sftp.as_ref().ok_or_else(|| TransportError::Remote {
            operation,
            path: path.to_string(),
            message: "connection lost: SFTP channel closed".into(),
        })
    }
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str) -> Result<(i32, String), TransportError> {
        let exec_error = |e: ssh2::Error| sftp_error("exec", command, e);
        let mut channel = self.session.channel_session().map_err(exec_error)?;
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(exec_error)?;
        channel.exec(command).map_err(exec_error)?;

        let output = read_exec_output(command, &mut channel)?;

        channel.wait_close().map_err(exec_error)?;
        let status = channel.exit_status().map_err(exec_error)?;
        Ok((status, output))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read>, TransportError> {
        let file = self
            .sftp("open", path)?
            .open(Path::new(path))
            .map_err(|e| sftp_error("open", path, e))?;
        Ok(Box::new(file))
    }

    fn create_write(&mut self, path: &str) -> Result<Box<dyn Write>, TransportError> {
        let file = self
            .sftp("create", path)?
            .create(Path::new(path))
            .map_err(|e| sftp_error("create", path, e))?;
        Ok(Box::new(file))
    }

    fn mkdir_all(&mut self, path: &str) -> Result<(), TransportError> {
        let sftp = self.sftp("mkdir", path)?;
        let mut current = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(part);
            let dir = Path::new(&current);
            if sftp.stat(dir).is_ok() {
                continue;
            }
            if let Err(e) = sftp.mkdir(dir, 0o755) {
                // Lost a race with another writer: fine if it exists now.
                if sftp.stat(dir).is_err() {
                    return Err(sftp_error("mkdir", &current, e));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        // SFTP must go before the session it runs on.
        self.sftp.take();
        if let Err(e) = self.session.disconnect(None, "image-converter closing", None) {
            debug!(error = %e, "disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct BrokenStream;

    impl Read for BrokenStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
        }
    }

    #[test]
    fn exec_output_keeps_interleaved_stderr_lines() {
        let merged: &[u8] = b"/srv/a.jpg\nfind: '/srv/private': Permission denied\n/srv/b.png\n";
        let output = read_exec_output("find /srv", merged).unwrap();
        assert_eq!(output.lines().count(), 3);
        assert!(output.contains("Permission denied"));
    }

    #[test]
    fn exec_output_decodes_non_utf8_lossily() {
        let raw: &[u8] = b"/srv/caf\xe9.jpg\n";
        let output = read_exec_output("find /srv", raw).unwrap();
        assert!(output.starts_with("/srv/caf"));
        assert!(output.ends_with(".jpg\n"));
    }

    #[test]
    fn exec_read_failure_is_reported() {
        let err = read_exec_output("find /srv", BrokenStream).unwrap_err();
        match &err {
            TransportError::Remote {
                operation, path, ..
            } => {
                assert_eq!(*operation, "exec");
                assert_eq!(path, "find /srv");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        assert!(err.is_connection_error());
    }

    fn remote_config() -> RemoteConfig {
        RemoteConfig {
            enabled: true,
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn agent_auth_needs_socket() {
        let config = remote_config();
        assert!(matches!(
            resolve_auth(&config, None),
            Err(TransportError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            resolve_auth(&config, Some(String::new())),
            Err(TransportError::AuthenticationFailed(_))
        ));
        assert_eq!(
            resolve_auth(&config, Some("/tmp/agent.sock".into())).unwrap(),
            AuthMethod::Agent("/tmp/agent.sock".into())
        );
    }

    #[test]
    fn key_file_auth_when_agent_disabled() {
        let config = RemoteConfig {
            use_ssh_agent: false,
            key_path: Some("/keys/id_ed25519".into()),
            ..remote_config()
        };
        assert_eq!(
            resolve_auth(&config, None).unwrap(),
            AuthMethod::KeyFile(PathBuf::from("/keys/id_ed25519"))
        );
    }

    #[test]
    fn no_auth_method_is_error() {
        let config = RemoteConfig {
            use_ssh_agent: false,
            key_path: None,
            ..remote_config()
        };
        let err = resolve_auth(&config, Some("/tmp/agent.sock".into())).unwrap_err();
        assert!(err.to_string().contains("no authentication method"), "{err}");
    }

    #[test]
    fn connect_to_closed_port_is_connection_failed() {
        let config = RemoteConfig {
            host: "127.0.0.1".into(),
            port: 1,
            use_ssh_agent: false,
            key_path: Some("/nonexistent/key".into()),
            ..remote_config()
        };
        let connector = SshConnector::from_config(&config).unwrap();
        assert_eq!(connector.describe(), "user@127.0.0.1:1");
        let err = connector.connect().err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)), "{err}");
        assert!(err.is_connection_error());
    }
}
