//! Production codec.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / tool |
//! |---|---|
//! | Decode JPEG, PNG, WebP | `image` crate |
//! | Decode AVIF | `avif-parse` + `rav1d` (see `avif_decode`) |
//! | Decode HEIC, HEIF | `heif-convert` from libheif, via a temporary PNG |
//! | Encode AVIF | `image::codecs::avif::AvifEncoder` (rav1e) |
//! | Encode WebP | strategy chosen in [`webp::default_encoder`] |
//! | Verify WebP / AVIF | decode the bytes again |

use super::avif_decode::decode_avif;
use super::backend::{CodecError, ImageCodec, OutputFormat};
use super::params::{AvifOptions, WebpOptions};
use super::webp::{self, WebpEncoder};
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Codec used for real runs.
///
/// The WebP strategy and the HEIF helper are resolved once when the codec is
/// built, not per file.
pub struct RustCodec {
    webp: Box<dyn WebpEncoder>,
    heif_convert: Option<PathBuf>,
}

impl RustCodec {
    /// Inspect the system and bind the best available encoders.
    pub fn detect() -> Self {
        Self {
            webp: webp::default_encoder(),
            heif_convert: which::which("heif-convert").ok(),
        }
    }

    /// Build with an explicit WebP strategy and no HEIF helper.
    pub fn with_webp_encoder(webp: Box<dyn WebpEncoder>) -> Self {
        Self {
            webp,
            heif_convert: None,
        }
    }

    pub fn webp_encoder_name(&self) -> &'static str {
        self.webp.name()
    }

    fn decode_heif(&self, bytes: &[u8], extension: &str) -> Result<DynamicImage, CodecError> {
        let program = self.heif_convert.as_deref().ok_or_else(|| {
            CodecError::Unsupported(format!(
                "{extension} needs heif-convert (libheif-examples) on PATH"
            ))
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("image-converter-heif-")
            .tempdir()?;
        let input = scratch.path().join(format!("input{extension}"));
        let output = scratch.path().join("output.png");
        std::fs::write(&input, bytes)?;

        let result = heif_convert_command(program, &input, &output).output()?;
        if !result.status.success() {
            return Err(CodecError::Decode(format!(
                "heif-convert exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        let png = std::fs::read(&output)?;
        decode_with(&png, ImageFormat::Png)
    }
}

fn heif_convert_command(program: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg(input).arg(output);
    cmd
}

fn decode_with(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, CodecError> {
    image::load_from_memory_with_format(bytes, format)
        .map_err(|e| CodecError::Decode(format!("{format:?}: {e}")))
}

impl ImageCodec for RustCodec {
    fn decode(&self, bytes: &[u8], extension: &str) -> Result<DynamicImage, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Decode("file is empty".into()));
        }
        match extension {
            ".jpg" | ".jpeg" => decode_with(bytes, ImageFormat::Jpeg),
            ".png" => decode_with(bytes, ImageFormat::Png),
            ".webp" => decode_with(bytes, ImageFormat::WebP),
            ".avif" => decode_avif(bytes),
            ".heic" | ".heif" => self.decode_heif(bytes, extension),
            other => Err(CodecError::Unsupported(other.to_string())),
        }
    }

    fn encode_webp(
        &self,
        image: &DynamicImage,
        options: &WebpOptions,
    ) -> Result<Vec<u8>, CodecError> {
        self.webp.encode(image, options)
    }

    fn encode_avif(
        &self,
        image: &DynamicImage,
        options: &AvifOptions,
    ) -> Result<Vec<u8>, CodecError> {
        // rav1e accepts 8-bit RGB(A) input; normalize 16-bit and gray sources.
        let source = match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image.clone(),
            other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };
        let mut buf = Vec::new();
        let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
            &mut buf,
            options.encoder_speed(),
            options.encoder_quality(),
        );
        source
            .write_with_encoder(encoder)
            .map_err(|e| CodecError::Encode(format!("AVIF: {e}")))?;
        Ok(buf)
    }

    fn verify(&self, bytes: &[u8], format: OutputFormat) -> Result<(), CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Decode(format!("{format} output is empty")));
        }
        match format {
            OutputFormat::WebP => decode_with(bytes, ImageFormat::WebP).map(|_| ()),
            OutputFormat::Avif => decode_avif(bytes).map(|_| ()),
        }
    }
}
