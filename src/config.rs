//! Run configuration.
//!
//! Loaded once at startup from a TOML file and passed by reference into every
//! component. There is no global configuration state.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [input]
//! directory = "./images"
//! supported_extensions = [".jpg", ".jpeg", ".png", ".heic", ".heif"]
//!
//! [conversion]
//! workers = 4                 # Parallel workers in local mode (minimum 1)
//!
//! [conversion.webp]
//! enabled = true
//! quality = 80                # 0-100
//! compression_level = 4       # 0-6, cwebp -m
//!
//! [conversion.avif]
//! enabled = true
//! quality = 40                # 1-63 quantizer, lower is better
//! speed = 6                   # 0-10, higher is faster
//! lossless = false
//!
//! [remote]
//! enabled = false
//! host = "localhost"
//! port = 22
//! user = "user"
//! # key_path = "~/.ssh/id_ed25519"
//! known_hosts = "~/.ssh/known_hosts"
//! remote_path = "/var/www/html/images"
//! use_ssh_agent = true
//! timeout = 60                # seconds, minimum 60
//! # temp_dir = "/var/tmp/image-converter"
//!
//! [mode]
//! dry_run = false
//!
//! [batch]
//! size = 10                   # files per remote batch
//! pause_secs = 5              # pause before every batch but the first
//!
//! [retry]
//! max_retries = 3
//! initial_wait_ms = 2000
//! max_wait_ms = 30000
//! factor = 2.0
//!
//! [logging]
//! level = "info"
//! directory = "logs"
//! file = true
//! ```
//!
//! Out-of-range numbers are clamped by [`Config::normalize`] with a warning.
//! Settings that make a run impossible are rejected by [`Config::validate`].
//! Unknown keys are rejected to catch typos early.

use crate::discovery::normalize_extension;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Connection timeouts below this are raised to it.
pub const MIN_REMOTE_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Complete run configuration.
///
/// All fields have defaults. A config file needs only the values it wants
/// to override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub input: InputConfig,
    pub conversion: ConversionConfig,
    pub remote: RemoteConfig,
    pub mode: ModeConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Root directory scanned in local mode.
    pub directory: PathBuf,
    /// Accepted source extensions. Case and leading dot do not matter.
    pub supported_extensions: Vec<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./images"),
            supported_extensions: [".jpg", ".jpeg", ".png", ".heic", ".heif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionConfig {
    /// Worker threads for local mode. Signed so that `0` or `-1` in a file
    /// are accepted and raised to 1 instead of failing to parse.
    pub workers: i64,
    pub webp: WebpConfig,
    pub avif: AvifConfig,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            webp: WebpConfig::default(),
            avif: AvifConfig::default(),
        }
    }
}

impl ConversionConfig {
    /// Worker count actually used by the pool (always at least 1).
    pub fn effective_workers(&self) -> usize {
        usize::try_from(self.workers).unwrap_or(0).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebpConfig {
    pub enabled: bool,
    /// Lossy quality, 0-100.
    pub quality: i64,
    /// Encoder effort, 0-6.
    pub compression_level: i64,
}

impl Default for WebpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: 80,
            compression_level: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AvifConfig {
    pub enabled: bool,
    /// AV1 quantizer, 1 (best) to 63 (smallest).
    pub quality: i64,
    /// Encoder speed, 0 (slowest) to 10 (fastest).
    pub speed: i64,
    pub lossless: bool,
}

impl Default for AvifConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: 40,
            speed: 6,
            lossless: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key used when the SSH agent is disabled.
    pub key_path: Option<String>,
    /// Known-hosts file. When it cannot be read, any host key is accepted.
    pub known_hosts: Option<String>,
    /// Remote directory searched for images. Outputs are uploaded next to
    /// their sources.
    pub remote_path: String,
    pub use_ssh_agent: bool,
    /// Connection and handshake timeout in seconds.
    pub timeout: u64,
    /// Local scratch directory for downloads. System temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 22,
            user: "user".to_string(),
            key_path: None,
            known_hosts: Some("~/.ssh/known_hosts".to_string()),
            remote_path: "/var/www/html/images".to_string(),
            use_ssh_agent: true,
            timeout: MIN_REMOTE_TIMEOUT_SECS,
            temp_dir: None,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn expanded_key_path(&self) -> Option<PathBuf> {
        self.key_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_path)
    }

    pub fn expanded_known_hosts(&self) -> Option<PathBuf> {
        self.known_hosts
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModeConfig {
    /// Discover and report without encoding, writing or transferring.
    pub dry_run: bool,
}

/// Remote batch pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub size: usize,
    pub pause_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 10,
            pause_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_wait_ms: u64,
    pub max_wait_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_wait_ms: policy.initial_wait.as_millis() as u64,
            max_wait_ms: policy.max_wait.as_millis() as u64,
            factor: policy.factor,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_wait: Duration::from_millis(self.initial_wait_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
            factor: self.factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for the per-run log file.
    pub directory: PathBuf,
    /// Write a timestamped log file in addition to stderr.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
            file: true,
        }
    }
}

impl Config {
    /// Parse a TOML config file.
    ///
    /// A missing file yields stock defaults. The result is neither clamped
    /// nor validated: callers install logging, then [`normalize`](Self::normalize),
    /// apply CLI overrides and validate.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config.normalize())
    }

    /// Clamp out-of-range values into their legal ranges.
    ///
    /// Every adjustment is logged as a warning. Never fails.
    pub fn normalize(mut self) -> Self {
        if self.conversion.workers < 1 {
            warn!(
                configured = self.conversion.workers,
                "conversion.workers must be at least 1, using 1"
            );
            self.conversion.workers = 1;
        }

        let webp = &mut self.conversion.webp;
        webp.quality = clamp_logged("conversion.webp.quality", webp.quality, 0, 100);
        webp.compression_level =
            clamp_logged("conversion.webp.compression_level", webp.compression_level, 0, 6);

        let avif = &mut self.conversion.avif;
        avif.quality = clamp_logged("conversion.avif.quality", avif.quality, 1, 63);
        avif.speed = clamp_logged("conversion.avif.speed", avif.speed, 0, 10);

        if self.remote.timeout < MIN_REMOTE_TIMEOUT_SECS {
            warn!(
                configured = self.remote.timeout,
                "remote.timeout below {MIN_REMOTE_TIMEOUT_SECS}s, raising to {MIN_REMOTE_TIMEOUT_SECS}s"
            );
            self.remote.timeout = MIN_REMOTE_TIMEOUT_SECS;
        }

        if self.batch.size == 0 {
            warn!("batch.size must be at least 1, using 1");
            self.batch.size = 1;
        }

        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            warn!(configured = self.retry.factor, "retry.factor below 1.0, using 1.0");
            self.retry.factor = 1.0;
        }

        let mut extensions: Vec<String> = self
            .input
            .supported_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .filter(|e| e.len() > 1)
            .collect();
        extensions.sort();
        extensions.dedup();
        self.input.supported_extensions = extensions;

        self
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.supported_extensions.is_empty() {
            return Err(ConfigError::Validation(
                "input.supported_extensions must not be empty".into(),
            ));
        }
        if !self.conversion.webp.enabled && !self.conversion.avif.enabled {
            return Err(ConfigError::Validation(
                "at least one of conversion.webp or conversion.avif must be enabled".into(),
            ));
        }
        if self.remote.enabled {
            let remote = &self.remote;
            if remote.host.trim().is_empty() {
                return Err(ConfigError::Validation("remote.host must be set".into()));
            }
            if remote.user.trim().is_empty() {
                return Err(ConfigError::Validation("remote.user must be set".into()));
            }
            if remote.remote_path.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "remote.remote_path must be set".into(),
                ));
            }
            if !remote.use_ssh_agent && remote.expanded_key_path().is_none() {
                return Err(ConfigError::Validation(
                    "remote mode needs use_ssh_agent = true or a remote.key_path".into(),
                ));
            }
        }
        Ok(())
    }
}

fn clamp_logged(key: &str, value: i64, min: i64, max: i64) -> i64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(key, configured = value, used = clamped, "value out of range, clamping");
    }
    clamped
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unknown variables expand to the empty string.
pub fn expand_path(raw: &str) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    let with_home = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("{home}{rest}"),
        _ => raw.to_string(),
    };
    PathBuf::from(expand_env_vars(&with_home))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# image-converter configuration
# =============================
# All options are optional. Values shown are the defaults.

[input]
# Directory scanned recursively in local mode.
directory = "./images"
# Source extensions to convert (case-insensitive, leading dot optional).
supported_extensions = [".jpg", ".jpeg", ".png", ".heic", ".heif"]

[conversion]
# Parallel workers in local mode. Values below 1 are raised to 1.
workers = 4

[conversion.webp]
enabled = true
# Lossy quality 0-100. Honored when cwebp is installed; the built-in
# fallback encoder is lossless.
quality = 80
# Encoder effort 0-6 (cwebp -m).
compression_level = 4

[conversion.avif]
enabled = true
# AV1 quantizer 1-63. Lower means higher quality and larger files.
quality = 40
# Encoder speed 0-10. Higher is faster.
speed = 6
lossless = false

[remote]
# Convert files on a remote host over SSH/SFTP instead of ./images.
enabled = false
host = "localhost"
port = 22
user = "user"
# key_path = "~/.ssh/id_ed25519"
# Host keys are verified against this file when it can be read.
# Otherwise any host key is accepted.
known_hosts = "~/.ssh/known_hosts"
remote_path = "/var/www/html/images"
# Authenticate through SSH_AUTH_SOCK. When false, key_path is required.
use_ssh_agent = true
# Connect/handshake timeout in seconds. Values below 60 are raised to 60.
timeout = 60
# Local scratch directory for downloads (system temp dir when unset).
# temp_dir = "/var/tmp/image-converter"

[mode]
# List what would be converted without writing anything.
dry_run = false

[batch]
# Remote files are processed in batches of this size...
size = 10
# ...with this pause (seconds) before every batch but the first.
pause_secs = 5

[retry]
# Remote operations are retried with exponential backoff.
max_retries = 3
initial_wait_ms = 2000
max_wait_ms = 30000
factor = 2.0

[logging]
# Default log filter when RUST_LOG is unset.
level = "info"
# Directory for per-run log files (image-converter_YYYYMMDD_HHMMSS.log).
directory = "logs"
file = true
"##
}
