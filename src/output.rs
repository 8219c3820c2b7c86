//! CLI output formatting for run results.
//!
//! Progress and per-file events go through `tracing`; this module renders
//! the blocks printed to stdout when a run ends.
//!
//! # Output Format
//!
//! ## Summary
//!
//! ```text
//! Conversion summary
//!     Files processed: 25
//!     WebP: 24 succeeded, 1 failed
//!     AVIF: 25 succeeded, 0 failed
//!     Decode failures: 1
//!     Started: 2024-03-09 07:05:01
//!     Elapsed: 1m 02s
//! ```
//!
//! Remote runs add transfer lines:
//!
//! ```text
//!     Downloads failed: 1
//!     Uploaded: 48
//!     Uploads failed: 2 (1 skipped before transfer)
//! ```
//!
//! ## Dry run
//!
//! ```text
//! Dry run: 2 files
//! 001 /img/a.jpg
//!     WebP → /img/a.webp
//!     AVIF → /img/a.avif
//! 002 /img/b.png
//!     WebP → /img/b.webp
//!     AVIF → /img/b.avif
//! ```
//!
//! # Architecture
//!
//! Each block has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::convert::ConversionResult;
use crate::local::LocalReport;
use crate::remote::RemoteReport;
use crate::stats::StatsSnapshot;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `12.3s` under a minute, `4m 05s` under an hour, `1h 02m 03s` beyond.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..60 => format!("{:.1}s", elapsed.as_secs_f64()),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m {:02}s", secs / 3600, secs % 3600 / 60, secs % 60),
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Final counters. Transfer lines are shown for remote runs only.
pub fn format_summary(snapshot: &StatsSnapshot, remote: bool) -> Vec<String> {
    let i = indent(1);
    let mut lines = vec![
        "Conversion summary".to_string(),
        format!("{i}Files processed: {}", snapshot.total_processed),
        format!(
            "{i}WebP: {} succeeded, {} failed",
            snapshot.webp.succeeded, snapshot.webp.failed
        ),
        format!(
            "{i}AVIF: {} succeeded, {} failed",
            snapshot.avif.succeeded, snapshot.avif.failed
        ),
    ];
    if snapshot.convert_failed > 0 {
        lines.push(format!("{i}Decode failures: {}", snapshot.convert_failed));
    }
    if remote {
        if snapshot.download_failed > 0 {
            lines.push(format!("{i}Downloads failed: {}", snapshot.download_failed));
        }
        lines.push(format!("{i}Uploaded: {}", snapshot.uploaded));
        if snapshot.upload_failed > 0 {
            let mut line = format!("{i}Uploads failed: {}", snapshot.upload_failed);
            if snapshot.skipped_uploads > 0 {
                line.push_str(&format!(
                    " ({} skipped before transfer)",
                    snapshot.skipped_uploads
                ));
            }
            lines.push(line);
        }
    }
    lines.push(format!(
        "{i}Started: {}",
        snapshot.started_at.format("%Y-%m-%d %H:%M:%S")
    ));
    lines.push(format!("{i}Elapsed: {}", format_elapsed(snapshot.elapsed)));
    lines
}

pub fn print_summary(snapshot: &StatsSnapshot, remote: bool) {
    for line in format_summary(snapshot, remote) {
        println!("{}", line);
    }
}

// ============================================================================
// Run reports
// ============================================================================

pub fn format_local_report(report: &LocalReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Found {} files, {} already converted",
        report.discovered, report.already_converted
    )];
    let skipped = report.pool.skipped_count();
    if skipped > 0 {
        lines.push(format!("Cancelled: {} files not started", skipped));
    }
    lines
}

pub fn format_remote_report(report: &RemoteReport) -> Vec<String> {
    let files: usize = report.batch_sizes.iter().sum();
    let mut lines = vec![format!(
        "Remote: {} files in {} batches, {} pauses, {} reconnects",
        files,
        report.batch_sizes.len(),
        report.pauses,
        report.reconnects
    )];
    if report.cancelled {
        lines.push("Cancelled before all batches ran".to_string());
    }
    lines
}

pub fn print_local_report(report: &LocalReport) {
    for line in format_local_report(report) {
        println!("{}", line);
    }
}

pub fn print_remote_report(report: &RemoteReport) {
    for line in format_remote_report(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Dry run
// ============================================================================

/// Intended outputs for every planned file, enabled formats only.
pub fn format_dry_run<'a>(planned: impl IntoIterator<Item = &'a ConversionResult>) -> Vec<String> {
    let mut body = Vec::new();
    let mut count = 0;
    for (pos, result) in planned.into_iter().enumerate() {
        count += 1;
        body.push(format!(
            "{} {}",
            format_index(pos + 1),
            result.original.display()
        ));
        for (format, outcome) in result.outcomes() {
            if let Some(path) = &outcome.output_path {
                body.push(format!(
                    "{}{} \u{2192} {}",
                    indent(1),
                    format,
                    path.display()
                ));
            }
        }
    }

    let mut lines = vec![format!(
        "Dry run: {} {}",
        count,
        if count == 1 { "file" } else { "files" }
    )];
    lines.extend(body);
    lines
}

pub fn print_dry_run<'a>(planned: impl IntoIterator<Item = &'a ConversionResult>) {
    for line in format_dry_run(planned) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================
