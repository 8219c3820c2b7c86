//! Encoder parameters.
//!
//! Both types clamp on construction so an encoder never sees an out-of-range
//! value, whatever the config file said.
//!
//! - [`WebpOptions`]: quality 0-100, compression level (cwebp `-m`) 0-6.
//! - [`AvifOptions`]: AV1 quantizer 1-63, speed 0-10, lossless flag.

use crate::config::{AvifConfig, WebpConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebpOptions {
    quality: u8,
    method: u8,
}

impl WebpOptions {
    pub fn new(quality: i64, method: i64) -> Self {
        Self {
            quality: quality.clamp(0, 100) as u8,
            method: method.clamp(0, 6) as u8,
        }
    }

    pub fn from_config(config: &WebpConfig) -> Self {
        Self::new(config.quality, config.compression_level)
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn method(&self) -> u8 {
        self.method
    }
}

impl Default for WebpOptions {
    fn default() -> Self {
        Self::new(80, 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvifOptions {
    quality: u8,
    speed: u8,
    lossless: bool,
}

impl AvifOptions {
    pub fn new(quality: i64, speed: i64, lossless: bool) -> Self {
        Self {
            quality: quality.clamp(1, 63) as u8,
            speed: speed.clamp(0, 10) as u8,
            lossless,
        }
    }

    pub fn from_config(config: &AvifConfig) -> Self {
        Self::new(config.quality, config.speed, config.lossless)
    }

    /// AV1 quantizer as configured: 1 is best, 63 is smallest.
    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn lossless(&self) -> bool {
        self.lossless
    }

    /// Quality on the rav1e encoder's 1-100 scale (higher is better).
    ///
    /// The quantizer scale runs the other way, so 1 maps to 100 and 63 to 1.
    /// Lossless always maps to 100.
    pub fn encoder_quality(&self) -> u8 {
        if self.lossless {
            return 100;
        }
        let q = u32::from(self.quality);
        (100 - (q - 1) * 99 / 62) as u8
    }

    /// Speed on the rav1e encoder's 1-10 scale.
    pub fn encoder_speed(&self) -> u8 {
        self.speed.max(1)
    }
}

impl Default for AvifOptions {
    fn default() -> Self {
        Self::new(40, 6, false)
    }
}
