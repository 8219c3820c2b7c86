//! # Image Converter
//!
//! Batch converter from JPEG, PNG, HEIC and HEIF to WebP and AVIF. Every
//! output is written next to its source with the same stem, then read back
//! and decoded before it counts as a success.
//!
//! # Two Modes
//!
//! ```text
//! local   input.directory ─ discover ─ skip converted ─ rayon pool (W workers) ─ summary
//! remote  SSH host ─ find ─ batches of N ─ download → convert → upload → clean ─ summary
//! ```
//!
//! Local mode converts in place with a bounded worker pool. Remote mode runs
//! over a single SSH session: files are pulled into a scratch directory one
//! at a time, converted, and the outputs are uploaded next to the remote
//! sources. Connection drops are repaired by reconnecting, and every remote
//! operation runs under an exponential-backoff retry policy.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `config.toml` loading, clamping and validation; stock config |
//! | [`discovery`] | Local walk and remote `find` listing of candidate files |
//! | [`codec`] | Decode / encode / verify behind the [`codec::ImageCodec`] trait |
//! | [`convert`] | One file: decode once, encode each enabled format, validate |
//! | [`pool`] | Bounded rayon pool for local runs |
//! | [`local`] | Local run orchestration |
//! | [`remote`] | SSH transport, reconnects and batch orchestration |
//! | [`retry`] | Generic retry with exponential backoff |
//! | [`stats`] | Shared run counters and serializable snapshot |
//! | [`progress`] | Throttled progress bar |
//! | [`output`] | End-of-run summary and dry-run listing |
//! | [`error`] | Run-level error taxonomy |
//! | [`logging`] | `tracing` subscriber: stderr plus per-run log file |
//! | [`memory`] | Memory usage report between remote batches |
//! | [`cancel`] | Ctrl-C cancellation between files |
//!
//! # Design Decisions
//!
//! ## Failures Stay With Their File
//!
//! A file that cannot be read, decoded, encoded, downloaded or uploaded is
//! logged and counted, and the run moves on. Only configuration, connection
//! and discovery problems stop a run. A local run that finished with failures
//! still prints its summary and then exits non-zero.
//!
//! ## Idempotent Reruns
//!
//! A source whose every enabled output already exists is skipped, so an
//! interrupted local run can simply be started again.
//!
//! ## Codec Seam
//!
//! All pixel work goes through [`codec::ImageCodec`]. Pipeline tests use a
//! recording mock instead of real encoders, and the WebP strategy (`cwebp` or
//! the built-in lossless encoder) is chosen once per run.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod error;
pub mod local;
pub mod logging;
pub mod memory;
pub mod output;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod stats;

pub use error::RunError;
