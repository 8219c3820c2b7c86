//! Bounded parallel conversion for local runs.
//!
//! [`run_pool`] builds a dedicated rayon pool of exactly `workers` threads and
//! runs one [`ConversionTask`] per candidate inside it. At most `workers`
//! files are in flight at once, and the call returns only after every task has
//! finished (`install` + `par_iter().collect()` is the join barrier).
//!
//! A failing file never stops the others. Results come back in candidate
//! order, so [`PoolReport::first_error`] is the first failure in list order,
//! not the first one to happen.
//!
//! Cancellation is checked before each task starts. Tasks that had not
//! started are reported as [`TaskOutcome::Skipped`] and are not counted as
//! processed.

use crate::cancel::CancelToken;
use crate::codec::ImageCodec;
use crate::convert::{ConversionResult, ConversionTask, ConvertError, run_task};
use crate::error::RunError;
use crate::progress::ProgressObserver;
use crate::stats::ConversionStats;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What one task produced.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The file was read and decoded; per-format outcomes are inside.
    Converted(ConversionResult),
    /// Read or decode failed.
    Failed(ConvertError),
    /// Cancelled before starting.
    Skipped(PathBuf),
}

impl TaskOutcome {
    pub fn path(&self) -> &Path {
        match self {
            TaskOutcome::Converted(result) => &result.original,
            TaskOutcome::Failed(err) => err.path(),
            TaskOutcome::Skipped(path) => path,
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            TaskOutcome::Converted(result) => result.first_failure().is_some(),
            TaskOutcome::Failed(_) => true,
            TaskOutcome::Skipped(_) => false,
        }
    }

    /// File-scoped error for this outcome, if it failed.
    pub fn error(&self) -> Option<RunError> {
        match self {
            TaskOutcome::Converted(result) => RunError::from_result(result),
            TaskOutcome::Failed(err) => Some(RunError::DecodeFailed {
                path: err.path().to_path_buf(),
                message: err.cause(),
            }),
            TaskOutcome::Skipped(_) => None,
        }
    }
}

/// Every task outcome, in candidate order.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl PoolReport {
    pub fn first_error(&self) -> Option<RunError> {
        self.outcomes.iter().find_map(TaskOutcome::error)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Skipped(_)))
            .count()
    }

    pub fn results(&self) -> impl Iterator<Item = &ConversionResult> {
        self.outcomes.iter().filter_map(|o| match o {
            TaskOutcome::Converted(result) => Some(result),
            _ => None,
        })
    }

    /// `Ok` when nothing failed, otherwise the first failure in list order.
    pub fn into_result(self) -> Result<Self, RunError> {
        let failed = self.failed_count();
        match self.first_error() {
            Some(first) => Err(RunError::FilesFailed {
                failed,
                total: self.outcomes.len(),
                first: Box::new(first),
            }),
            None => Ok(self),
        }
    }
}

/// Run every task with at most `workers` in flight.
///
/// `workers` below 1 is treated as 1.
pub fn run_pool<C: ImageCodec>(
    codec: &C,
    tasks: &[ConversionTask<'_>],
    workers: usize,
    stats: &ConversionStats,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> Result<PoolReport, RunError> {
    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("convert-{i}"))
        .build()?;

    info!(files = tasks.len(), workers, "starting conversion");
    observer.start(tasks.len() as u64);

    let outcomes: Vec<TaskOutcome> = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| execute(codec, task, stats, observer, cancel))
            .collect()
    });
    observer.finish();

    let report = PoolReport { outcomes };
    let skipped = report.skipped_count();
    if skipped > 0 {
        warn!(skipped, "run cancelled before all files started");
    }
    Ok(report)
}

fn execute<C: ImageCodec>(
    codec: &C,
    task: &ConversionTask<'_>,
    stats: &ConversionStats,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> TaskOutcome {
    let path = &task.candidate.path;
    if cancel.is_cancelled() {
        debug!(path = %path.display(), "skipped, run cancelled");
        return TaskOutcome::Skipped(path.clone());
    }

    let outcome = match run_task(codec, task) {
        Ok(result) => {
            stats.record_result(&result);
            for (format, outcome) in result.outcomes() {
                if let Some(error) = outcome.error.as_deref() {
                    error!(path = %path.display(), %format, %error, "conversion failed");
                }
            }
            TaskOutcome::Converted(result)
        }
        Err(err) => {
            stats.record_convert_failure();
            error!(path = %path.display(), error = %err, "conversion failed");
            TaskOutcome::Failed(err)
        }
    };
    observer.file_done(path, !outcome.is_failure());
    outcome
}
