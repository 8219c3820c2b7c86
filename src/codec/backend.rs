//! Codec trait and shared types.
//!
//! The [`ImageCodec`] trait is the boundary between the conversion pipeline
//! and pixel work. The pipeline only needs four capabilities: decode a
//! source, encode WebP, encode AVIF, and verify that produced bytes decode.
//!
//! The production implementation is
//! [`RustCodec`](super::rust_backend::RustCodec). Tests use the recording
//! [`MockCodec`](tests::MockCodec).

use super::params::{AvifOptions, WebpOptions};
use image::DynamicImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
}

/// Formats the converter produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    WebP,
    Avif,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 2] = [OutputFormat::WebP, OutputFormat::Avif];

    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::WebP => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OutputFormat::WebP => "WebP",
            OutputFormat::Avif => "AVIF",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything the pipeline needs from a codec.
///
/// `Sync` so a single codec can be shared by every rayon worker.
pub trait ImageCodec: Sync {
    /// Decode source bytes. `extension` is normalized (`".jpg"`).
    fn decode(&self, bytes: &[u8], extension: &str) -> Result<DynamicImage, CodecError>;

    fn encode_webp(&self, image: &DynamicImage, options: &WebpOptions)
    -> Result<Vec<u8>, CodecError>;

    fn encode_avif(&self, image: &DynamicImage, options: &AvifOptions)
    -> Result<Vec<u8>, CodecError>;

    /// Check that encoded bytes decode again.
    fn verify(&self, bytes: &[u8], format: OutputFormat) -> Result<(), CodecError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Codec that records calls and returns canned bytes.
    ///
    /// Uses Mutex (not RefCell) so it is Sync and works across rayon workers.
    /// Empty input fails to decode, like a truncated file would.
    pub struct MockCodec {
        pub webp_bytes: Vec<u8>,
        pub avif_bytes: Vec<u8>,
        /// Outputs whose bytes equal one of these fail verification.
        pub undecodable: HashSet<Vec<u8>>,
        pub fail_webp_encode: bool,
        pub operations: Mutex<Vec<RecordedOp>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Decode { extension: String, len: usize },
        EncodeWebp { quality: u8 },
        EncodeAvif { quality: u8, speed: u8, lossless: bool },
        Verify(OutputFormat),
    }

    impl Default for MockCodec {
        fn default() -> Self {
            Self {
                webp_bytes: b"RIFF-mock-webp".to_vec(),
                avif_bytes: b"mock-avif".to_vec(),
                undecodable: HashSet::new(),
                fail_webp_encode: false,
                operations: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockCodec {
        pub fn new() -> Self {
            Self::default()
        }

        /// AVIF encoder that produces bytes which never verify.
        pub fn with_corrupt_avif() -> Self {
            let corrupt = b"corrupt-avif".to_vec();
            Self {
                avif_bytes: corrupt.clone(),
                undecodable: HashSet::from([corrupt]),
                ..Self::default()
            }
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        fn record(&self, op: RecordedOp) {
            self.operations.lock().unwrap().push(op);
        }
    }

    impl ImageCodec for MockCodec {
        fn decode(&self, bytes: &[u8], extension: &str) -> Result<DynamicImage, CodecError> {
            self.record(RecordedOp::Decode {
                extension: extension.to_string(),
                len: bytes.len(),
            });
            if bytes.is_empty() {
                return Err(CodecError::Decode("empty input".into()));
            }
            Ok(DynamicImage::new_rgb8(4, 4))
        }

        fn encode_webp(
            &self,
            _image: &DynamicImage,
            options: &WebpOptions,
        ) -> Result<Vec<u8>, CodecError> {
            self.record(RecordedOp::EncodeWebp {
                quality: options.quality(),
            });
            if self.fail_webp_encode {
                return Err(CodecError::Encode("mock webp failure".into()));
            }
            Ok(self.webp_bytes.clone())
        }

        fn encode_avif(
            &self,
            _image: &DynamicImage,
            options: &AvifOptions,
        ) -> Result<Vec<u8>, CodecError> {
            self.record(RecordedOp::EncodeAvif {
                quality: options.quality(),
                speed: options.speed(),
                lossless: options.lossless(),
            });
            Ok(self.avif_bytes.clone())
        }

        fn verify(&self, bytes: &[u8], format: OutputFormat) -> Result<(), CodecError> {
            self.record(RecordedOp::Verify(format));
            if bytes.is_empty() || self.undecodable.contains(bytes) {
                return Err(CodecError::Decode(format!("mock {format} does not decode")));
            }
            Ok(())
        }
    }

    #[test]
    fn mock_records_decode() {
        let codec = MockCodec::new();
        let image = codec.decode(b"jpeg", ".jpg").unwrap();
        assert_eq!(image.width(), 4);
        assert_eq!(
            codec.get_operations(),
            vec![RecordedOp::Decode {
                extension: ".jpg".into(),
                len: 4
            }]
        );
    }

    #[test]
    fn mock_empty_input_fails_decode() {
        let codec = MockCodec::new();
        assert!(matches!(
            codec.decode(b"", ".png"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn mock_corrupt_avif_fails_verify() {
        let codec = MockCodec::with_corrupt_avif();
        let image = DynamicImage::new_rgb8(1, 1);
        let bytes = codec.encode_avif(&image, &AvifOptions::default()).unwrap();
        assert!(codec.verify(&bytes, OutputFormat::Avif).is_err());
    }

    #[test]
    fn output_format_extensions() {
        assert_eq!(OutputFormat::WebP.extension(), "webp");
        assert_eq!(OutputFormat::Avif.extension(), "avif");
        assert_eq!(OutputFormat::Avif.to_string(), "AVIF");
    }
}
