//! Per-file progress reporting.
//!
//! Workers call [`ProgressObserver::file_done`] once per finished file,
//! success or failure. [`ProgressTracker`] counts every call but forwards at
//! most one redraw per [`REDRAW_INTERVAL`] to its [`ProgressRenderer`]; the
//! final position is always flushed by [`ProgressObserver::finish`].
//!
//! | Renderer | Used for |
//! |---|---|
//! | [`BarRenderer`] | interactive console (indicatif) |
//! | [`NoProgress`] | dry runs and tests |

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Roughly ten redraws per second.
pub const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Receives one call per completed file. Must tolerate concurrent callers.
pub trait ProgressObserver: Sync {
    /// Announce the total before work starts.
    fn start(&self, total: u64);
    fn file_done(&self, path: &Path, succeeded: bool);
    /// Flush the final position.
    fn finish(&self);
}

/// Something that can draw a position.
pub trait ProgressRenderer: Send {
    fn set_length(&mut self, total: u64);
    fn render(&mut self, done: u64, failed: u64, current: &str);
    fn finish(&mut self, done: u64, failed: u64);
}

/// Ignores every call.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn start(&self, _total: u64) {}
    fn file_done(&self, _path: &Path, _succeeded: bool) {}
    fn finish(&self) {}
}

struct TrackerState<R> {
    renderer: R,
    done: u64,
    failed: u64,
    last_render: Option<Instant>,
}

/// Throttling observer in front of a renderer.
pub struct ProgressTracker<R: ProgressRenderer> {
    state: Mutex<TrackerState<R>>,
    interval: Duration,
}

impl<R: ProgressRenderer> ProgressTracker<R> {
    pub fn new(renderer: R) -> Self {
        Self::with_interval(renderer, REDRAW_INTERVAL)
    }

    pub fn with_interval(renderer: R, interval: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                renderer,
                done: 0,
                failed: 0,
                last_render: None,
            }),
            interval,
        }
    }

    /// Files reported so far.
    pub fn completed(&self) -> u64 {
        self.lock().done
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn inspect(&self) -> std::sync::MutexGuard<'_, TrackerState<R>> {
        self.lock()
    }
}

impl<R: ProgressRenderer> ProgressObserver for ProgressTracker<R> {
    fn start(&self, total: u64) {
        self.lock().renderer.set_length(total);
    }

    fn file_done(&self, path: &Path, succeeded: bool) {
        let mut state = self.lock();
        state.done += 1;
        if !succeeded {
            state.failed += 1;
        }
        let due = state
            .last_render
            .is_none_or(|at| at.elapsed() >= self.interval);
        if due {
            let name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (done, failed) = (state.done, state.failed);
            state.renderer.render(done, failed, &name);
            state.last_render = Some(Instant::now());
        }
    }

    fn finish(&self) {
        let mut state = self.lock();
        let (done, failed) = (state.done, state.failed);
        state.renderer.finish(done, failed);
    }
}

/// indicatif bar on stderr.
pub struct BarRenderer {
    bar: ProgressBar,
}

impl BarRenderer {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for BarRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRenderer for BarRenderer {
    fn set_length(&mut self, total: u64) {
        self.bar.set_length(total);
    }

    fn render(&mut self, done: u64, failed: u64, current: &str) {
        self.bar.set_position(done);
        if failed > 0 {
            self.bar.set_message(format!("{current} ({failed} failed)"));
        } else {
            self.bar.set_message(current.to_string());
        }
    }

    fn finish(&mut self, done: u64, failed: u64) {
        self.bar.set_position(done);
        self.bar
            .finish_with_message(format!("{done} files, {failed} failed"));
    }
}
