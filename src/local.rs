//! Local run: discover under `input.directory`, drop files that are already
//! converted, then convert the rest on the worker pool.
//!
//! A dry run goes through the same path. Tasks only plan their output paths,
//! so nothing is read, encoded or written.

use crate::cancel::CancelToken;
use crate::codec::ImageCodec;
use crate::config::Config;
use crate::convert::{ConversionSettings, ConversionTask};
use crate::discovery::{self, ExtensionSet};
use crate::error::RunError;
use crate::pool::{self, PoolReport};
use crate::progress::ProgressObserver;
use crate::stats::ConversionStats;
use tracing::info;

#[derive(Debug, Default)]
pub struct LocalReport {
    pub discovered: usize,
    /// Candidates skipped because every enabled output already exists.
    pub already_converted: usize,
    pub pool: PoolReport,
}

pub fn run_local<K: ImageCodec>(
    config: &Config,
    codec: &K,
    stats: &ConversionStats,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> Result<LocalReport, RunError> {
    config.validate()?;
    let settings = ConversionSettings::from_config(config);
    let extensions = ExtensionSet::new(&config.input.supported_extensions);

    let candidates = discovery::discover_local(&config.input.directory, &extensions)?;
    let discovered = candidates.len();
    let pending = discovery::filter_converted(candidates, &settings.enabled_formats());
    let already_converted = discovered - pending.len();

    if pending.is_empty() {
        info!(discovered, "every file is already converted");
        return Ok(LocalReport {
            discovered,
            already_converted,
            pool: PoolReport::default(),
        });
    }

    let tasks: Vec<ConversionTask<'_>> = pending
        .into_iter()
        .map(|candidate| ConversionTask::new(candidate, &settings))
        .collect();
    let workers = config.conversion.effective_workers();
    let pool = pool::run_pool(codec, &tasks, workers, stats, observer, cancel)?;

    Ok(LocalReport {
        discovered,
        already_converted,
        pool,
    })
}
