//! Retry with exponential backoff for remote operations.
//!
//! [`with_retry`] runs an operation up to `max_retries + 1` times. After each
//! failed attempt except the last it sleeps for the current wait, then
//! multiplies the wait by `factor`, capped at `max_wait`:
//!
//! ```text
//! attempt 1 ─fail→ sleep 2s → attempt 2 ─fail→ sleep 4s → attempt 3 ─fail→ sleep 8s → attempt 4
//! ```
//!
//! Sleeping goes through the [`Sleeper`] trait so tests can record the
//! schedule instead of waiting.

use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Message fragments that mark an error as a transient network failure.
const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "connection lost",
    "connection reset",
    "broken pipe",
    "timeout",
    "timed out",
    "connection refused",
    "no route to host",
    "network is unreachable",
    "i/o timeout",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The waits slept between attempts, in order. Has `max_retries` entries.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut wait = self.initial_wait.min(self.max_wait);
        let mut schedule = Vec::with_capacity(self.max_retries as usize);
        for _ in 0..self.max_retries {
            schedule.push(wait);
            wait = self.next_wait(wait);
        }
        schedule
    }

    /// Products too large for a `Duration` saturate at `max_wait`.
    fn next_wait(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.factor.max(1.0))
            .map_or(self.max_wait, |next| next.min(self.max_wait))
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Returned when every attempt failed. Wraps the last error.
#[derive(Error, Debug)]
#[error("giving up after {retries} retries: {source}")]
pub struct RetryError<E: std::error::Error + 'static> {
    pub retries: u32,
    #[source]
    pub source: E,
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The closure receives the 1-based attempt number.
pub fn with_retry<T, E, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Result<T, E>,
{
    let total_attempts = policy.max_retries + 1;
    let schedule = policy.backoff_schedule();
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => match schedule.get(attempt as usize - 1) {
                None => {
                    return Err(RetryError {
                        retries: policy.max_retries,
                        source: err,
                    });
                }
                Some(&wait) => {
                    warn!(
                        attempt,
                        of = total_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    sleeper.sleep(wait);
                    attempt += 1;
                }
            },
        }
    }
}

/// Whether an error message looks like a transient connection failure.
///
/// Case-insensitive substring match against [`CONNECTION_ERROR_MARKERS`].
pub fn is_connection_error(err: &dyn Display) -> bool {
    let message = err.to_string().to_lowercase();
    CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
