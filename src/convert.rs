//! One file through the codec.
//!
//! [`run_task`] reads a source file, decodes it once, then encodes, writes
//! and validates each enabled output format in turn:
//!
//! ```text
//! beach.jpg ─ read ─ decode ─┬─ encode WebP ─ write beach.webp ─ validate
//!                            └─ encode AVIF ─ write beach.avif ─ validate
//! ```
//!
//! Read and decode failures fail the whole file ([`ConvertError`]). An encode,
//! write or validation failure fails only that format and is recorded in the
//! [`FormatOutcome`]; the other format still runs. Outputs are staged in a
//! temporary sibling and renamed into place only after they validate, so a
//! corrupt file never lands on disk and a failed attempt never removes an
//! output from an earlier run.
//!
//! In dry-run mode nothing is read or written: each enabled format records
//! its intended output path with `attempted == false`.

use crate::codec::{AvifOptions, CodecError, ImageCodec, OutputFormat, WebpOptions};
use crate::config::Config;
use crate::discovery::CandidateFile;
use crate::remote::UploadCheck;
use image::DynamicImage;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to decode {path}: {source}")]
    DecodeFailed { path: PathBuf, source: CodecError },
}

impl ConvertError {
    pub fn path(&self) -> &Path {
        match self {
            ConvertError::Read { path, .. } | ConvertError::DecodeFailed { path, .. } => path,
        }
    }

    /// The underlying cause without the path.
    pub fn cause(&self) -> String {
        match self {
            ConvertError::Read { source, .. } => source.to_string(),
            ConvertError::DecodeFailed { source, .. } => source.to_string(),
        }
    }
}

/// Run-wide encoding parameters. A format is enabled when its options are set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionSettings {
    pub webp: Option<WebpOptions>,
    pub avif: Option<AvifOptions>,
    pub dry_run: bool,
}

impl ConversionSettings {
    pub fn from_config(config: &Config) -> Self {
        let conversion = &config.conversion;
        Self {
            webp: conversion
                .webp
                .enabled
                .then(|| WebpOptions::from_config(&conversion.webp)),
            avif: conversion
                .avif
                .enabled
                .then(|| AvifOptions::from_config(&conversion.avif)),
            dry_run: config.mode.dry_run,
        }
    }

    /// Enabled formats, WebP first.
    pub fn enabled_formats(&self) -> Vec<OutputFormat> {
        OutputFormat::ALL
            .into_iter()
            .filter(|f| self.is_enabled(*f))
            .collect()
    }

    pub fn is_enabled(&self, format: OutputFormat) -> bool {
        match format {
            OutputFormat::WebP => self.webp.is_some(),
            OutputFormat::Avif => self.avif.is_some(),
        }
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            webp: Some(WebpOptions::default()),
            avif: Some(AvifOptions::default()),
            dry_run: false,
        }
    }
}

/// A file plus the settings it is converted with.
#[derive(Debug, Clone)]
pub struct ConversionTask<'a> {
    pub candidate: CandidateFile,
    pub settings: &'a ConversionSettings,
}

impl<'a> ConversionTask<'a> {
    pub fn new(candidate: CandidateFile, settings: &'a ConversionSettings) -> Self {
        Self {
            candidate,
            settings,
        }
    }
}

/// What happened to one output format.
///
/// `succeeded` implies `attempted`, a non-zero `byte_size`, and an output
/// file that decodes again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormatOutcome {
    pub attempted: bool,
    pub succeeded: bool,
    pub output_path: Option<PathBuf>,
    pub byte_size: u64,
    pub error: Option<String>,
}

impl FormatOutcome {
    fn planned(path: PathBuf) -> Self {
        Self {
            output_path: Some(path),
            ..Self::default()
        }
    }

    fn written(path: PathBuf, byte_size: u64) -> Self {
        Self {
            attempted: true,
            succeeded: true,
            output_path: Some(path),
            byte_size,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            attempted: true,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.attempted && !self.succeeded
    }
}

/// Per-file result. Built once by [`run_task`] and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionResult {
    pub original: PathBuf,
    pub webp: FormatOutcome,
    pub avif: FormatOutcome,
    pub dry_run: bool,
}

impl ConversionResult {
    pub fn outcome(&self, format: OutputFormat) -> &FormatOutcome {
        match format {
            OutputFormat::WebP => &self.webp,
            OutputFormat::Avif => &self.avif,
        }
    }

    pub fn outcomes(&self) -> [(OutputFormat, &FormatOutcome); 2] {
        [
            (OutputFormat::WebP, &self.webp),
            (OutputFormat::Avif, &self.avif),
        ]
    }

    /// First failed format with its error message.
    pub fn first_failure(&self) -> Option<(OutputFormat, &str)> {
        self.outcomes().into_iter().find_map(|(format, outcome)| {
            outcome
                .is_failure()
                .then(|| (format, outcome.error.as_deref().unwrap_or("unknown error")))
        })
    }

    /// Outputs that were written and validated.
    pub fn produced(&self) -> impl Iterator<Item = (OutputFormat, &Path)> {
        self.outcomes().into_iter().filter_map(|(format, outcome)| {
            if outcome.succeeded {
                outcome.output_path.as_deref().map(|p| (format, p))
            } else {
                None
            }
        })
    }
}

/// Convert one file. See the module docs for the failure rules.
pub fn run_task(
    codec: &impl ImageCodec,
    task: &ConversionTask<'_>,
) -> Result<ConversionResult, ConvertError> {
    let source = &task.candidate.path;
    let settings = task.settings;

    if settings.dry_run {
        let plan = |format| {
            if settings.is_enabled(format) {
                FormatOutcome::planned(task.candidate.output_path(format))
            } else {
                FormatOutcome::default()
            }
        };
        return Ok(ConversionResult {
            original: source.clone(),
            webp: plan(OutputFormat::WebP),
            avif: plan(OutputFormat::Avif),
            dry_run: true,
        });
    }

    let image = {
        let bytes = fs::read(source).map_err(|e| ConvertError::Read {
            path: source.clone(),
            source: e,
        })?;
        codec
            .decode(&bytes, &task.candidate.extension)
            .map_err(|e| ConvertError::DecodeFailed {
                path: source.clone(),
                source: e,
            })?
    };
    debug!(path = %source.display(), width = image.width(), height = image.height(), "decoded");

    let webp = match &settings.webp {
        Some(options) => convert_format(codec, &image, source, OutputFormat::WebP, |img| {
            codec.encode_webp(img, options)
        }),
        None => FormatOutcome::default(),
    };
    let avif = match &settings.avif {
        Some(options) => convert_format(codec, &image, source, OutputFormat::Avif, |img| {
            codec.encode_avif(img, options)
        }),
        None => FormatOutcome::default(),
    };

    Ok(ConversionResult {
        original: source.clone(),
        webp,
        avif,
        dry_run: false,
    })
}

fn convert_format(
    codec: &impl ImageCodec,
    image: &DynamicImage,
    source: &Path,
    format: OutputFormat,
    encode: impl FnOnce(&DynamicImage) -> Result<Vec<u8>, CodecError>,
) -> FormatOutcome {
    let output = crate::discovery::output_path(source, format);
    let outcome = encode(image)
        .map_err(|e| format!("encode: {e}"))
        .and_then(|bytes| write_validated(codec, &output, format, &bytes));

    match outcome {
        Ok(byte_size) => {
            debug!(output = %output.display(), byte_size, "{format} written");
            FormatOutcome::written(output, byte_size)
        }
        Err(error) => {
            warn!(source = %source.display(), %error, "{format} conversion failed");
            FormatOutcome::failed(error)
        }
    }
}

/// Write `bytes` to a temporary sibling, validate it, then rename it over
/// `output`. On failure the temporary file is removed and any existing
/// `output` is left as it was.
fn write_validated(
    codec: &impl ImageCodec,
    output: &Path,
    format: OutputFormat,
    bytes: &[u8],
) -> Result<u64, String> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".image-converter-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile_in(dir)
        .map_err(|e| format!("write {}: {e}", output.display()))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.flush())
        .map_err(|e| format!("write {}: {e}", output.display()))?;

    let byte_size = validate_output(codec, staged.path(), format)?;
    staged
        .persist(output)
        .map_err(|e| format!("write {}: {}", output.display(), e.error))?;
    Ok(byte_size)
}

/// Output exists, is non-empty, and decodes when read back from disk.
pub fn validate_output(
    codec: &impl ImageCodec,
    path: &Path,
    format: OutputFormat,
) -> Result<u64, String> {
    let len = fs::metadata(path)
        .map_err(|e| format!("output missing: {e}"))?
        .len();
    if len == 0 {
        return Err("output is empty".into());
    }
    let bytes = fs::read(path).map_err(|e| format!("read back: {e}"))?;
    codec
        .verify(&bytes, format)
        .map_err(|e| format!("output does not decode: {e}"))?;
    Ok(len)
}

/// Pre-upload check for converted outputs.
pub struct OutputValidator<'a, C: ImageCodec> {
    pub codec: &'a C,
    pub format: OutputFormat,
}

impl<C: ImageCodec> UploadCheck for OutputValidator<'_, C> {
    fn check(&self, path: &Path) -> Result<u64, String> {
        validate_output(self.codec, path, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::backend::tests::{MockCodec, RecordedOp};
    use crate::discovery::DiscoverySource;
    use tempfile::TempDir;

    fn candidate(dir: &TempDir, name: &str, bytes: &[u8]) -> CandidateFile {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        CandidateFile::new(path, DiscoverySource::LocalDisk).unwrap()
    }

    fn assert_invariants(result: &ConversionResult) {
        for (_, outcome) in result.outcomes() {
            if outcome.succeeded {
                assert!(outcome.attempted);
                let path = outcome.output_path.as_ref().unwrap();
                assert!(outcome.byte_size > 0);
                assert_eq!(fs::metadata(path).unwrap().len(), outcome.byte_size);
            }
        }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    #[test]
    fn settings_from_config() {
        let mut config = Config::default();
        config.conversion.webp.enabled = false;
        config.conversion.avif.quality = 20;
        config.mode.dry_run = true;

        let settings = ConversionSettings::from_config(&config);
        assert!(settings.webp.is_none());
        assert_eq!(settings.avif.unwrap().quality(), 20);
        assert!(settings.dry_run);
        assert_eq!(settings.enabled_formats(), vec![OutputFormat::Avif]);
    }

    // =========================================================================
    // Real runs
    // =========================================================================

    #[test]
    fn converts_both_formats() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::new();
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.webp.succeeded && result.avif.succeeded);
        assert_eq!(fs::read(tmp.path().join("a.webp")).unwrap(), codec.webp_bytes);
        assert_eq!(fs::read(tmp.path().join("a.avif")).unwrap(), codec.avif_bytes);
        assert_invariants(&result);
        assert_eq!(result.produced().count(), 2);

        let ops = codec.get_operations();
        let decodes = ops
            .iter()
            .filter(|op| matches!(op, RecordedOp::Decode { .. }))
            .count();
        assert_eq!(decodes, 1, "source is decoded once");
        assert!(ops.contains(&RecordedOp::Verify(OutputFormat::Avif)));
    }

    #[test]
    fn empty_source_is_decode_failure() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::new();
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "b.png", b""), &settings);

        let err = run_task(&codec, &task).unwrap_err();
        assert!(matches!(err, ConvertError::DecodeFailed { .. }));
        assert_eq!(err.path(), tmp.path().join("b.png"));
        assert!(!tmp.path().join("b.webp").exists());
        assert!(!tmp.path().join("b.avif").exists());
    }

    #[test]
    fn missing_source_is_read_failure() {
        let tmp = TempDir::new().unwrap();
        let settings = ConversionSettings::default();
        let candidate =
            CandidateFile::new(tmp.path().join("gone.jpg"), DiscoverySource::LocalDisk).unwrap();
        let err = run_task(&MockCodec::new(), &ConversionTask::new(candidate, &settings))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Read { .. }));
    }

    #[test]
    fn corrupt_avif_is_deleted_and_webp_survives() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::with_corrupt_avif();
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.webp.succeeded);
        assert!(result.avif.is_failure());
        assert!(!tmp.path().join("a.avif").exists());
        let (format, error) = result.first_failure().unwrap();
        assert_eq!(format, OutputFormat::Avif);
        assert!(error.contains("does not decode"), "{error}");
        assert_invariants(&result);
    }

    #[test]
    fn zero_byte_output_is_failure() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec {
            webp_bytes: Vec::new(),
            ..MockCodec::new()
        };
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert_eq!(result.webp.error.as_deref(), Some("output is empty"));
        assert!(!tmp.path().join("a.webp").exists());
        assert!(result.avif.succeeded);
    }

    #[test]
    fn encode_failure_recorded_per_format() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec {
            fail_webp_encode: true,
            ..MockCodec::new()
        };
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.webp.is_failure());
        assert!(result.webp.error.as_deref().unwrap().starts_with("encode:"));
        assert!(result.avif.succeeded);
    }

    #[test]
    fn failed_encode_keeps_output_from_earlier_run() {
        let tmp = TempDir::new().unwrap();
        let earlier = tmp.path().join("a.webp");
        fs::write(&earlier, b"RIFF-earlier-webp").unwrap();
        let codec = MockCodec {
            fail_webp_encode: true,
            ..MockCodec::new()
        };
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.webp.is_failure());
        assert_eq!(fs::read(&earlier).unwrap(), b"RIFF-earlier-webp");
        assert!(result.avif.succeeded);
    }

    #[test]
    fn invalid_output_keeps_output_from_earlier_run() {
        let tmp = TempDir::new().unwrap();
        let earlier = tmp.path().join("a.avif");
        fs::write(&earlier, b"earlier-avif").unwrap();
        let codec = MockCodec::with_corrupt_avif();
        let settings = ConversionSettings::default();
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.avif.is_failure());
        assert_eq!(fs::read(&earlier).unwrap(), b"earlier-avif");
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".image-converter-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn disabled_format_is_not_attempted() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::new();
        let settings = ConversionSettings {
            avif: None,
            ..ConversionSettings::default()
        };
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert_eq!(result.avif, FormatOutcome::default());
        assert!(!tmp.path().join("a.avif").exists());
    }

    // =========================================================================
    // Dry run
    // =========================================================================

    #[test]
    fn dry_run_plans_without_touching_codec_or_disk() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::new();
        let settings = ConversionSettings {
            dry_run: true,
            ..ConversionSettings::default()
        };
        let task = ConversionTask::new(candidate(&tmp, "a.jpg", b"jpeg"), &settings);

        let result = run_task(&codec, &task).unwrap();
        assert!(result.dry_run);
        assert!(!result.webp.attempted && !result.avif.attempted);
        assert_eq!(result.webp.output_path, Some(tmp.path().join("a.webp")));
        assert_eq!(result.avif.output_path, Some(tmp.path().join("a.avif")));
        assert!(codec.get_operations().is_empty());
        assert!(!tmp.path().join("a.webp").exists());
    }

    // =========================================================================
    // Upload check
    // =========================================================================

    #[test]
    fn output_validator_rejects_empty_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let codec = MockCodec::with_corrupt_avif();
        let check = OutputValidator {
            codec: &codec,
            format: OutputFormat::Avif,
        };

        let empty = tmp.path().join("e.avif");
        fs::write(&empty, b"").unwrap();
        assert!(check.check(&empty).is_err());

        let corrupt = tmp.path().join("c.avif");
        fs::write(&corrupt, b"corrupt-avif").unwrap();
        assert!(check.check(&corrupt).is_err());

        let good = tmp.path().join("g.avif");
        fs::write(&good, b"fine").unwrap();
        assert_eq!(check.check(&good), Ok(4));
    }
}
