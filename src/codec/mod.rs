//! Image codecs: decode sources, encode WebP and AVIF, verify outputs.
//!
//! | Operation | Implementation |
//! |---|---|
//! | **Decode JPEG / PNG / WebP** | `image` crate |
//! | **Decode AVIF** | `avif-parse` (container) + `rav1d` (AV1) |
//! | **Decode HEIC / HEIF** | external `heif-convert` (libheif) |
//! | **Encode AVIF** | `image::codecs::avif::AvifEncoder` (rav1e) |
//! | **Encode WebP** | `cwebp` when installed, else `image` lossless encoder |
//!
//! The module is split into:
//! - **Backend**: the [`ImageCodec`] trait every codec implements
//! - **Parameters**: clamped [`WebpOptions`] / [`AvifOptions`]
//! - **WebP**: ordered encoder strategies, selected once per run
//! - **AVIF decode**: rav1d-based decoder used to verify AVIF outputs
//! - **RustCodec**: the production implementation

mod avif_decode;
pub mod backend;
mod params;
pub mod rust_backend;
pub mod webp;

pub use backend::{CodecError, ImageCodec, OutputFormat};
pub use params::{AvifOptions, WebpOptions};
pub use rust_backend::RustCodec;
