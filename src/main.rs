use clap::{Parser, Subcommand};
use image_converter::cancel::CancelToken;
use image_converter::codec::RustCodec;
use image_converter::config::{self, Config};
use image_converter::local::run_local;
use image_converter::progress::{BarRenderer, NoProgress, ProgressObserver, ProgressTracker};
use image_converter::remote::run_remote;
use image_converter::stats::ConversionStats;
use image_converter::{RunError, logging, output};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "image-converter")]
#[command(about = "Convert JPEG, PNG and HEIC images to WebP and AVIF")]
#[command(long_about = "\
Convert JPEG, PNG and HEIC images to WebP and AVIF

Outputs are written next to each source with the same name:

  images/
  ├── beach.jpg
  ├── beach.webp        # written
  ├── beach.avif        # written
  └── 2024/
      └── dusk.HEIC     # subdirectories are searched too

Sources whose outputs already exist are skipped, so an interrupted run can be
started again. With --remote (or remote.enabled in the config) the images are
read from and written back to an SSH host over SFTP, in paced batches.

Run 'image-converter gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Config file; stock defaults are used when it does not exist
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// List intended outputs without converting or transferring anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Convert images on the configured SSH host
    #[arg(long, global = true)]
    remote: bool,

    /// Write the final counters as JSON to this file
    #[arg(long, global = true)]
    summary_json: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert images (default)
    Run,
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::GenConfig) = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let raw = Config::read(&cli.config)?;
    let log_file = logging::init(&raw.logging)?;
    if let Some((path, _)) = &log_file {
        info!(path = %path.display(), "logging to file");
    }

    let mut config = raw.normalize();
    config.mode.dry_run |= cli.dry_run;
    config.remote.enabled |= cli.remote;
    let dry_run = config.mode.dry_run;
    let remote = config.remote.enabled;

    let cancel = CancelToken::new();
    if let Err(e) = cancel.cancel_on_ctrl_c() {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let codec = RustCodec::detect();
    info!(webp_encoder = codec.webp_encoder_name(), remote, dry_run, "starting");

    let stats = ConversionStats::new();
    let tracker = ProgressTracker::new(BarRenderer::new());
    let observer: &dyn ProgressObserver = if dry_run || cli.no_progress {
        &NoProgress
    } else {
        &tracker
    };

    let outcome: Result<(), RunError> = if remote {
        run_remote(&config, &codec, &stats, observer, cancel).map(|report| {
            if dry_run {
                output::print_dry_run(&report.planned);
            }
            output::print_remote_report(&report);
        })
    } else {
        run_local(&config, &codec, &stats, observer, &cancel).and_then(|report| {
            if dry_run {
                output::print_dry_run(report.pool.results());
            }
            output::print_local_report(&report);
            report.pool.into_result().map(|_| ())
        })
    };
    let outcome = match outcome {
        Err(err) if err.is_fatal() => {
            error!(error = %err, "run aborted");
            return Err(err.into());
        }
        other => other,
    };

    let snapshot = stats.snapshot();
    if !dry_run {
        output::print_summary(&snapshot, remote);
    }
    if snapshot.has_failures() {
        match &log_file {
            Some((path, _)) => warn!(log = %path.display(), "some files failed, details in the log"),
            None => warn!("some files failed, details above"),
        }
    }
    if let Some(path) = &cli.summary_json {
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        info!(path = %path.display(), "summary written");
    }

    outcome?;
    Ok(())
}
