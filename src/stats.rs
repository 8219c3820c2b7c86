//! Run-wide conversion counters.
//!
//! One [`ConversionStats`] is created per run and shared by reference with
//! every worker. All counters sit behind a single mutex, so a
//! [`snapshot`](ConversionStats::snapshot) always sees a consistent set and
//! concurrent increments are never lost. Counters only ever grow.

use crate::codec::OutputFormat;
use crate::convert::ConversionResult;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FormatCounts {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct Counters {
    total_processed: u64,
    webp: FormatCounts,
    avif: FormatCounts,
    convert_failed: u64,
    download_failed: u64,
    upload_failed: u64,
    uploaded: u64,
    skipped_uploads: u64,
}

impl Counters {
    fn format_mut(&mut self, format: OutputFormat) -> &mut FormatCounts {
        match format {
            OutputFormat::WebP => &mut self.webp,
            OutputFormat::Avif => &mut self.avif,
        }
    }
}

/// Point-in-time copy of the counters, for reports and `--summary-json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub webp: FormatCounts,
    pub avif: FormatCounts,
    pub convert_failed: u64,
    pub download_failed: u64,
    pub upload_failed: u64,
    pub uploaded: u64,
    pub skipped_uploads: u64,
    pub started_at: DateTime<Local>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl StatsSnapshot {
    pub fn format(&self, format: OutputFormat) -> FormatCounts {
        match format {
            OutputFormat::WebP => self.webp,
            OutputFormat::Avif => self.avif,
        }
    }

    /// Any file-level failure at all.
    pub fn has_failures(&self) -> bool {
        self.convert_failed > 0
            || self.download_failed > 0
            || self.upload_failed > 0
            || self.webp.failed > 0
            || self.avif.failed > 0
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Debug)]
pub struct ConversionStats {
    counters: Mutex<Counters>,
    started: Instant,
    started_at: DateTime<Local>,
}

impl Default for ConversionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
            started_at: Local::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay valid even if a holder panicked mid-increment.
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one finished task into the counters.
    ///
    /// Counts the file as processed when any format was attempted.
    pub fn record_result(&self, result: &ConversionResult) {
        let mut c = self.lock();
        let mut attempted = false;
        for (format, outcome) in result.outcomes() {
            if !outcome.attempted {
                continue;
            }
            attempted = true;
            let counts = c.format_mut(format);
            if outcome.succeeded {
                counts.succeeded += 1;
            } else {
                counts.failed += 1;
            }
        }
        if attempted {
            c.total_processed += 1;
        }
    }

    /// The source could not be read or decoded. Counts as processed.
    pub fn record_convert_failure(&self) {
        let mut c = self.lock();
        c.total_processed += 1;
        c.convert_failed += 1;
    }

    pub fn record_download_failure(&self) {
        self.lock().download_failed += 1;
    }

    pub fn record_upload(&self, succeeded: bool) {
        let mut c = self.lock();
        if succeeded {
            c.uploaded += 1;
        } else {
            c.upload_failed += 1;
        }
    }

    /// Output existed but failed the pre-upload check.
    pub fn record_skipped_upload(&self) {
        let mut c = self.lock();
        c.skipped_uploads += 1;
        c.upload_failed += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.lock().clone();
        StatsSnapshot {
            total_processed: c.total_processed,
            webp: c.webp,
            avif: c.avif,
            convert_failed: c.convert_failed,
            download_failed: c.download_failed,
            upload_failed: c.upload_failed,
            uploaded: c.uploaded,
            skipped_uploads: c.skipped_uploads,
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
        }
    }
}
