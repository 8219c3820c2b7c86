//! Remote batch orchestration.
//!
//! ## Phases
//!
//! ```text
//! Idle → ValidatingConfig → Connecting → Discovering → BatchRunning* → Reporting → Done
//! ```
//!
//! A failure while validating, connecting or discovering aborts the run.
//! Everything inside `BatchRunning` is scoped to one file: it is logged and
//! counted, and the next file starts.
//!
//! ## Per file
//!
//! ```text
//! /srv/img/2024/beach.jpg ─ download → <work>/2024/beach.jpg
//!                          ─ convert  → <work>/2024/beach.webp, beach.avif
//!                          ─ upload   → /srv/img/2024/beach.webp, beach.avif
//!                          ─ remove every local file for beach.*
//! ```
//!
//! Local files are removed whatever the outcome, so the work directory never
//! holds more than one file's artifacts.
//!
//! ## Pacing
//!
//! Candidates are split into consecutive batches of `batch.size`. Every batch
//! but the first starts after a `batch.pause_secs` pause. After each batch the
//! running totals and current memory usage are logged.

use crate::cancel::CancelToken;
use crate::codec::{ImageCodec, OutputFormat};
use crate::config::{BatchConfig, Config};
use crate::convert::{ConversionResult, ConversionSettings, ConversionTask, OutputValidator, run_task};
use crate::discovery::{self, CandidateFile, ExtensionSet};
use crate::error::RunError;
use crate::memory;
use crate::progress::ProgressObserver;
use crate::remote::ssh::SshConnector;
use crate::remote::transport::{Connector, RemoteTransport, TransportError};
use crate::retry::{Sleeper, ThreadSleeper};
use crate::stats::ConversionStats;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    ValidatingConfig,
    Connecting,
    Discovering,
    /// Zero-based batch index.
    BatchRunning { index: usize },
    Reporting,
    Done,
}

/// What a remote run did, beyond the shared counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteReport {
    /// Files handled per batch, in order.
    pub batch_sizes: Vec<usize>,
    pub pauses: usize,
    pub reconnects: u64,
    pub cancelled: bool,
    /// Dry run only: intended remote outputs per candidate.
    pub planned: Vec<ConversionResult>,
}

/// Split `len` items into consecutive batch sizes.
pub fn batch_sizes(len: usize, size: usize) -> Vec<usize> {
    let size = size.max(1);
    (0..len).step_by(size).map(|start| size.min(len - start)).collect()
}

/// Path of `remote` relative to `root`, `/`-separated and without a leading
/// slash. Files outside `root` keep only their file name.
pub fn relative_remote_path<'a>(root: &str, remote: &'a str) -> &'a str {
    let root = root.trim_end_matches('/');
    match remote.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => remote.rsplit('/').next().unwrap_or(remote),
    }
}

/// Sibling output next to a remote source.
pub fn remote_output_path(remote: &str, format: OutputFormat) -> String {
    discovery::output_path(Path::new(remote), format)
        .to_string_lossy()
        .into_owned()
}

/// Drives one remote run.
pub struct BatchOrchestrator<'a, K: ImageCodec> {
    config: &'a Config,
    codec: &'a K,
    settings: ConversionSettings,
    stats: &'a ConversionStats,
    observer: &'a dyn ProgressObserver,
    cancel: CancelToken,
    sleeper: Arc<dyn Sleeper>,
    phases: Vec<RunPhase>,
}

impl<'a, K: ImageCodec> BatchOrchestrator<'a, K> {
    pub fn new(
        config: &'a Config,
        codec: &'a K,
        stats: &'a ConversionStats,
        observer: &'a dyn ProgressObserver,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            codec,
            settings: ConversionSettings::from_config(config),
            stats,
            observer,
            cancel,
            sleeper: Arc::new(ThreadSleeper),
            phases: vec![RunPhase::Idle],
        }
    }

    /// Replace the sleeper used for batch pauses and retry backoff.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Phase entered most recently.
    pub fn phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Idle)
    }

    /// Every phase entered so far, in order.
    pub fn phases(&self) -> &[RunPhase] {
        &self.phases
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(?phase, "entering phase");
        self.phases.push(phase);
    }

    /// Validate, connect, discover, then work through the batches.
    ///
    /// `connect` builds the connector; it runs in the `Connecting` phase.
    pub fn run<C, F>(&mut self, connect: F) -> Result<RemoteReport, RunError>
    where
        C: Connector,
        F: FnOnce() -> Result<C, TransportError>,
    {
        self.enter(RunPhase::ValidatingConfig);
        self.config.validate()?;

        self.enter(RunPhase::Connecting);
        let connector = connect()?;
        let mut transport = RemoteTransport::connect(connector, self.config.retry.policy())?
            .with_sleeper(Arc::clone(&self.sleeper));

        self.enter(RunPhase::Discovering);
        let remote_root = self.config.remote.remote_path.clone();
        let extensions = ExtensionSet::new(&self.config.input.supported_extensions);
        let candidates = discovery::discover_remote(&mut transport, &remote_root, &extensions)?;

        let mut report = RemoteReport::default();
        if self.settings.dry_run {
            report.planned = self.plan(&candidates);
        } else {
            self.run_batches(&mut transport, &remote_root, &candidates, &mut report)?;
        }

        self.enter(RunPhase::Reporting);
        report.reconnects = transport.reconnect_count();
        transport.close();
        self.enter(RunPhase::Done);
        Ok(report)
    }

    fn plan(&self, candidates: &[CandidateFile]) -> Vec<ConversionResult> {
        candidates
            .iter()
            .filter_map(|candidate| {
                let task = ConversionTask::new(candidate.clone(), &self.settings);
                run_task(self.codec, &task).ok()
            })
            .collect()
    }

    fn work_dir(&self) -> io::Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("image-converter-");
            b
        };
        match &self.config.remote.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }

    fn run_batches<C: Connector>(
        &mut self,
        transport: &mut RemoteTransport<C>,
        remote_root: &str,
        candidates: &[CandidateFile],
        report: &mut RemoteReport,
    ) -> Result<(), RunError> {
        let work = self.work_dir()?;
        let BatchConfig { size, pause_secs } = self.config.batch.clone();
        let total_batches = batch_sizes(candidates.len(), size).len();
        self.observer.start(candidates.len() as u64);

        for (index, batch) in candidates.chunks(size.max(1)).enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if index > 0 && pause_secs > 0 {
                info!(secs = pause_secs, "pausing before next batch");
                self.sleeper.sleep(Duration::from_secs(pause_secs));
                report.pauses += 1;
            }
            self.enter(RunPhase::BatchRunning { index });
            info!(batch = index + 1, of = total_batches, files = batch.len(), "batch started");

            let mut handled = 0;
            for candidate in batch {
                if self.cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let ok = self.process_file(transport, remote_root, work.path(), candidate);
                self.observer.file_done(&candidate.path, ok);
                handled += 1;
            }
            report.batch_sizes.push(handled);

            let snap = self.stats.snapshot();
            info!(
                batch = index + 1,
                of = total_batches,
                processed = snap.total_processed,
                uploaded = snap.uploaded,
                download_failed = snap.download_failed,
                convert_failed = snap.convert_failed,
                upload_failed = snap.upload_failed,
                "batch complete"
            );
            info!(memory = %memory::memory_report(), "memory after batch");
        }

        self.observer.finish();
        if report.cancelled {
            warn!(
                remaining = candidates.len() - report.batch_sizes.iter().sum::<usize>(),
                "run cancelled"
            );
        }
        Ok(())
    }

    /// Download, convert, upload and clean up one file. Returns whether every
    /// step succeeded.
    fn process_file<C: Connector>(
        &self,
        transport: &mut RemoteTransport<C>,
        remote_root: &str,
        work_dir: &Path,
        candidate: &CandidateFile,
    ) -> bool {
        let remote = candidate.path.to_string_lossy().into_owned();
        let local = work_dir.join(relative_remote_path(remote_root, &remote));
        info!(remote = %remote, "processing");

        let ok = self.transfer_and_convert(transport, &remote, &local, candidate);
        remove_local_artifacts(&local);
        ok
    }

    fn transfer_and_convert<C: Connector>(
        &self,
        transport: &mut RemoteTransport<C>,
        remote: &str,
        local: &Path,
        candidate: &CandidateFile,
    ) -> bool {
        if let Err(source) = transport.download(remote, local) {
            self.stats.record_download_failure();
            let err = RunError::TransferFailed {
                path: remote.to_string(),
                source,
            };
            error!(operation = "download", error = %err, "file failed");
            return false;
        }

        let local_candidate = CandidateFile {
            path: local.to_path_buf(),
            extension: candidate.extension.clone(),
            source: candidate.source,
        };
        let task = ConversionTask::new(local_candidate, &self.settings);
        let result = match run_task(self.codec, &task) {
            Ok(result) => result,
            Err(e) => {
                self.stats.record_convert_failure();
                error!(operation = "convert", error = %RunError::from(e), "file failed");
                return false;
            }
        };
        self.stats.record_result(&result);
        let mut ok = match RunError::from_result(&result) {
            Some(err) => {
                error!(operation = "convert", error = %err, "file failed");
                false
            }
            None => true,
        };

        for (format, output) in result.produced() {
            let target = remote_output_path(remote, format);
            let check = OutputValidator {
                codec: self.codec,
                format,
            };
            match transport.upload(output, &target, &check) {
                Ok(bytes) => {
                    self.stats.record_upload(true);
                    debug!(remote = %target, bytes, "uploaded");
                }
                Err(TransportError::InvalidLocalFile { reason, .. }) => {
                    self.stats.record_skipped_upload();
                    warn!(output = %output.display(), %reason, "upload skipped");
                    ok = false;
                }
                Err(source) => {
                    self.stats.record_upload(false);
                    let err = RunError::TransferFailed {
                        path: target,
                        source,
                    };
                    error!(operation = "upload", error = %err, "file failed");
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Remove a downloaded source and every sibling output.
fn remove_local_artifacts(local: &Path) {
    let mut paths: Vec<PathBuf> = vec![local.to_path_buf()];
    paths.extend(
        OutputFormat::ALL
            .into_iter()
            .map(|format| discovery::output_path(local, format)),
    );
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove local file"),
        }
    }
}

/// Remote run over SSH with settings from `config`.
pub fn run_remote<K: ImageCodec>(
    config: &Config,
    codec: &K,
    stats: &ConversionStats,
    observer: &dyn ProgressObserver,
    cancel: CancelToken,
) -> Result<RemoteReport, RunError> {
    let mut orchestrator = BatchOrchestrator::new(config, codec, stats, observer, cancel);
    let result = orchestrator.run(|| SshConnector::from_config(&config.remote));
    if let Err(e) = &result {
        error!(phase = ?orchestrator.phase(), error = %e, "remote run stopped");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::backend::tests::MockCodec;
    use crate::progress::NoProgress;
    use crate::remote::transport::tests::{FailPoint, MockConnector, MockRemote};
    use crate::retry::tests::RecordingSleeper;
    use tempfile::TempDir;

    fn remote_config(work: &TempDir) -> Config {
        let mut config = Config::default();
        config.remote.enabled = true;
        config.remote.remote_path = "/r".into();
        config.remote.temp_dir = Some(work.path().to_path_buf());
        config
    }

    /// Put `names` under `/r` and make the listing return them.
    fn seed(remote: &MockRemote, names: &[String], bytes: &[u8]) {
        let mut listing = String::new();
        for name in names {
            let path = format!("/r/{name}");
            remote.put_file(&path, bytes);
            listing.push_str(&path);
            listing.push('\n');
        }
        remote.set_exec_output(0, &listing);
    }

    fn numbered(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("img{i:02}.jpg")).collect()
    }

    struct Harness {
        remote: Arc<MockRemote>,
        sleeper: Arc<RecordingSleeper>,
        codec: MockCodec,
        stats: ConversionStats,
        work: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                remote: MockRemote::new(),
                sleeper: Arc::new(RecordingSleeper::default()),
                codec: MockCodec::new(),
                stats: ConversionStats::new(),
                work: TempDir::new().unwrap(),
            }
        }

        fn run(&self, config: &Config) -> (Result<RemoteReport, RunError>, Vec<RunPhase>) {
            self.run_with(config, CancelToken::new())
        }

        fn run_with(
            &self,
            config: &Config,
            cancel: CancelToken,
        ) -> (Result<RemoteReport, RunError>, Vec<RunPhase>) {
            let sleeper: Arc<dyn Sleeper> = self.sleeper.clone();
            let mut orchestrator =
                BatchOrchestrator::new(config, &self.codec, &self.stats, &NoProgress, cancel)
                    .with_sleeper(sleeper);
            let remote = Arc::clone(&self.remote);
            let result = orchestrator.run(move || Ok(MockConnector(remote)));
            (result, orchestrator.phases().to_vec())
        }

        fn work_dir_is_empty(&self) -> bool {
            walkdir::WalkDir::new(self.work.path())
                .into_iter()
                .filter_map(Result::ok)
                .all(|e| !e.file_type().is_file())
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn batch_sizes_split() {
        assert_eq!(batch_sizes(25, 10), vec![10, 10, 5]);
        assert_eq!(batch_sizes(20, 10), vec![10, 10]);
        assert_eq!(batch_sizes(3, 0), vec![1, 1, 1]);
        assert!(batch_sizes(0, 10).is_empty());
    }

    #[test]
    fn relative_paths_preserve_layout() {
        assert_eq!(relative_remote_path("/r", "/r/2024/a.jpg"), "2024/a.jpg");
        assert_eq!(relative_remote_path("/r/", "/r/a.jpg"), "a.jpg");
        assert_eq!(relative_remote_path("/r", "/rx/a.jpg"), "a.jpg");
        assert_eq!(relative_remote_path("/r", "/elsewhere/b.png"), "b.png");
    }

    #[test]
    fn remote_outputs_are_siblings() {
        assert_eq!(
            remote_output_path("/r/2024/a.jpg", OutputFormat::Avif),
            "/r/2024/a.avif"
        );
    }

    // =========================================================================
    // Batching
    // =========================================================================

    #[test]
    fn twenty_five_files_run_in_three_batches_with_two_pauses() {
        let h = Harness::new();
        seed(&h.remote, &numbered(25), b"jpeg");
        let config = remote_config(&h.work);

        let (result, phases) = h.run(&config);
        let report = result.unwrap();

        assert_eq!(report.batch_sizes, vec![10, 10, 5]);
        assert_eq!(report.pauses, 2);
        assert_eq!(
            h.sleeper.recorded(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
        assert_eq!(
            phases,
            vec![
                RunPhase::Idle,
                RunPhase::ValidatingConfig,
                RunPhase::Connecting,
                RunPhase::Discovering,
                RunPhase::BatchRunning { index: 0 },
                RunPhase::BatchRunning { index: 1 },
                RunPhase::BatchRunning { index: 2 },
                RunPhase::Reporting,
                RunPhase::Done,
            ]
        );

        let snap = h.stats.snapshot();
        assert_eq!(snap.total_processed, 25);
        assert_eq!(snap.uploaded, 50);
        assert_eq!(h.remote.file("/r/img24.webp").unwrap(), h.codec.webp_bytes);
        assert_eq!(h.remote.file("/r/img00.avif").unwrap(), h.codec.avif_bytes);
        assert!(h.work_dir_is_empty());
    }

    #[test]
    fn nested_remote_layout_is_preserved() {
        let h = Harness::new();
        seed(&h.remote, &["2024/summer/a.jpg".to_string()], b"jpeg");
        let config = remote_config(&h.work);

        h.run(&config).0.unwrap();
        assert!(h.remote.file("/r/2024/summer/a.webp").is_some());
        assert!(
            h.remote
                .dirs
                .lock()
                .unwrap()
                .contains(&"/r/2024/summer".to_string())
        );
    }

    // =========================================================================
    // Per-file failures
    // =========================================================================

    #[test]
    fn per_file_failures_do_not_stop_the_run() {
        let h = Harness::new();
        h.remote.put_file("/r/a.jpg", b"jpeg");
        // Empty on the remote: decode fails.
        h.remote.put_file("/r/b.png", b"");
        h.remote.put_file("/r/c.jpg", b"jpeg");
        // Listed but gone: download fails after retries.
        h.remote
            .set_exec_output(0, "/r/a.jpg\n/r/b.png\n/r/gone.jpg\n/r/c.jpg\n");
        let config = remote_config(&h.work);

        let report = h.run(&config).0.unwrap();
        assert_eq!(report.batch_sizes, vec![4]);

        let snap = h.stats.snapshot();
        assert_eq!(snap.download_failed, 1);
        assert_eq!(snap.convert_failed, 1);
        assert_eq!(snap.uploaded, 4);
        assert!(h.remote.file("/r/c.avif").is_some());
        assert!(h.remote.file("/r/b.webp").is_none());
        assert!(h.work_dir_is_empty());
    }

    #[test]
    fn corrupt_output_is_not_uploaded() {
        let mut h = Harness::new();
        h.codec = MockCodec::with_corrupt_avif();
        seed(&h.remote, &["a.jpg".into()], b"jpeg");
        let config = remote_config(&h.work);

        h.run(&config).0.unwrap();
        let snap = h.stats.snapshot();
        assert_eq!(snap.avif.failed, 1);
        assert_eq!(snap.uploaded, 1);
        assert!(h.remote.file("/r/a.avif").is_none());
    }

    #[test]
    fn upload_connection_error_reconnects_once() {
        let h = Harness::new();
        seed(&h.remote, &["a.jpg".into()], b"jpeg");
        h.remote.fail_next(FailPoint::Create, "connection reset by peer");
        let config = remote_config(&h.work);

        let report = h.run(&config).0.unwrap();
        assert_eq!(report.reconnects, 1);
        assert_eq!(h.remote.writes(), 2);
        assert_eq!(h.stats.snapshot().uploaded, 2);
    }

    // =========================================================================
    // Fatal phases
    // =========================================================================

    #[test]
    fn invalid_config_stops_before_connecting() {
        let h = Harness::new();
        let mut config = remote_config(&h.work);
        config.remote.host = String::new();

        let (result, phases) = h.run(&config);
        assert!(matches!(result, Err(RunError::InvalidInput(_))));
        assert_eq!(phases.last(), Some(&RunPhase::ValidatingConfig));
        assert_eq!(h.remote.connects(), 0);
    }

    #[test]
    fn connect_failure_is_fatal() {
        let h = Harness::new();
        h.remote.fail_next(FailPoint::Connect, "connection refused");
        let config = remote_config(&h.work);

        let (result, phases) = h.run(&config);
        assert!(matches!(result, Err(RunError::ConnectionFailed(_))));
        assert_eq!(phases.last(), Some(&RunPhase::Connecting));
    }

    #[test]
    fn phase_reports_where_a_run_stopped() {
        let h = Harness::new();
        h.remote.fail_next(FailPoint::Connect, "connection refused");
        let config = remote_config(&h.work);
        let mut orchestrator =
            BatchOrchestrator::new(&config, &h.codec, &h.stats, &NoProgress, CancelToken::new())
                .with_sleeper(h.sleeper.clone());
        assert_eq!(orchestrator.phase(), RunPhase::Idle);

        let remote = Arc::clone(&h.remote);
        assert!(orchestrator.run(move || Ok(MockConnector(remote))).is_err());
        assert_eq!(orchestrator.phase(), RunPhase::Connecting);
    }

    #[test]
    fn empty_listing_is_no_files_found() {
        let h = Harness::new();
        h.remote.set_exec_output(0, "\n");
        let config = remote_config(&h.work);

        let (result, phases) = h.run(&config);
        assert!(matches!(result, Err(RunError::NoFilesFound(ref root)) if root == "/r"));
        assert_eq!(phases.last(), Some(&RunPhase::Discovering));
    }

    #[test]
    fn listing_failure_is_discovery_failed() {
        let h = Harness::new();
        h.remote.set_exec_output(1, "find: '/r': No such file or directory");
        let config = remote_config(&h.work);

        let (result, _) = h.run(&config);
        assert!(matches!(result, Err(RunError::DiscoveryFailed(_))));
    }

    // =========================================================================
    // Dry run and cancellation
    // =========================================================================

    #[test]
    fn dry_run_plans_without_transfers() {
        let h = Harness::new();
        seed(&h.remote, &numbered(5), b"jpeg");
        let mut config = remote_config(&h.work);
        config.mode.dry_run = true;

        let report = h.run(&config).0.unwrap();
        assert_eq!(report.planned.len(), 5);
        assert_eq!(
            report.planned[0].webp.output_path,
            Some(PathBuf::from("/r/img00.webp"))
        );
        assert!(report.batch_sizes.is_empty());
        assert_eq!(h.remote.writes(), 0);
        assert!(h.work_dir_is_empty());
        assert!(h.codec.get_operations().is_empty());
    }

    #[test]
    fn cancelled_run_starts_no_batch() {
        let h = Harness::new();
        seed(&h.remote, &numbered(3), b"jpeg");
        let config = remote_config(&h.work);
        let cancel = CancelToken::new();
        cancel.cancel();

        let (result, phases) = h.run_with(&config, cancel);
        let report = result.unwrap();
        assert!(report.cancelled);
        assert!(report.batch_sizes.is_empty());
        assert!(!phases.iter().any(|p| matches!(p, RunPhase::BatchRunning { .. })));
        assert_eq!(phases.last(), Some(&RunPhase::Done));
    }
}
