//! WebP encoder strategies.
//!
//! Encoders are tried in priority order once at startup and the first
//! available one is bound for the whole run:
//!
//! | Priority | Strategy | Notes |
//! |---|---|---|
//! | 1 | [`CwebpCommand`] | libwebp's `cwebp` binary; lossy, honors quality and `-m` |
//! | 2 | [`ImageLossless`] | `image` crate encoder; always available, lossless only |

use super::backend::CodecError;
use super::params::WebpOptions;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

pub trait WebpEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn encode(&self, image: &DynamicImage, options: &WebpOptions) -> Result<Vec<u8>, CodecError>;
}

/// Pick the first available encoder from `candidates`.
pub fn select_encoder(candidates: Vec<Box<dyn WebpEncoder>>) -> Option<Box<dyn WebpEncoder>> {
    candidates.into_iter().find(|encoder| encoder.is_available())
}

/// The standard strategy list: `cwebp` if found on `PATH`, then the
/// in-process lossless encoder.
pub fn default_encoder() -> Box<dyn WebpEncoder> {
    let mut candidates: Vec<Box<dyn WebpEncoder>> = Vec::new();
    if let Some(cwebp) = CwebpCommand::from_path() {
        candidates.push(Box::new(cwebp));
    }
    candidates.push(Box::new(ImageLossless));
    let encoder = select_encoder(candidates).unwrap_or_else(|| Box::new(ImageLossless));
    info!(encoder = encoder.name(), "selected WebP encoder");
    encoder
}

/// Encodes through the external `cwebp` tool via a temporary PNG.
pub struct CwebpCommand {
    program: PathBuf,
}

impl CwebpCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate `cwebp` on `PATH`.
    pub fn from_path() -> Option<Self> {
        which::which("cwebp").ok().map(Self::new)
    }
}

/// Build the `cwebp` invocation for one conversion.
pub fn build_cwebp_command(
    program: &Path,
    input: &Path,
    output: &Path,
    options: &WebpOptions,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-quiet")
        .arg("-q")
        .arg(options.quality().to_string())
        .arg("-m")
        .arg(options.method().to_string())
        .arg(input)
        .arg("-o")
        .arg(output);
    cmd
}

impl WebpEncoder for CwebpCommand {
    fn name(&self) -> &'static str {
        "cwebp"
    }

    fn is_available(&self) -> bool {
        self.program.is_file()
    }

    fn encode(&self, image: &DynamicImage, options: &WebpOptions) -> Result<Vec<u8>, CodecError> {
        let scratch = tempfile::Builder::new()
            .prefix("image-converter-webp-")
            .tempdir()?;
        let input = scratch.path().join("input.png");
        let output = scratch.path().join("output.webp");

        image
            .save_with_format(&input, image::ImageFormat::Png)
            .map_err(|e| CodecError::Encode(format!("writing intermediate PNG: {e}")))?;

        let result = build_cwebp_command(&self.program, &input, &output, options).output()?;
        if !result.status.success() {
            return Err(CodecError::Encode(format!(
                "cwebp exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(std::fs::read(&output)?)
    }
}

/// The `image` crate's built-in encoder. Lossless only, so quality is ignored.
pub struct ImageLossless;

impl WebpEncoder for ImageLossless {
    fn name(&self) -> &'static str {
        "image (lossless)"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn encode(&self, image: &DynamicImage, _options: &WebpOptions) -> Result<Vec<u8>, CodecError> {
        // The encoder accepts only 8-bit RGB(A).
        let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
        let mut buf = Vec::new();
        let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut buf);
        rgba.write_with_encoder(encoder)
            .map_err(|e| CodecError::Encode(format!("WebP: {e}")))?;
        Ok(buf)
    }
}
