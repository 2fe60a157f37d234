//! Bounded retry with exponential backoff for transient faults.

use crate::scraper::ScraperError;
use std::time::Duration;

/// Default number of attempts (initial plus retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Backoff in seconds after each failed attempt.
const DEFAULT_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
/// Backoff for HTTP 429: wait longer so the server can recover.
const RATE_LIMIT_BACKOFF_SECS: [u64; 3] = [30, 60, 90];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
    rate_limit_backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: secs(&DEFAULT_BACKOFF_SECS),
            rate_limit_backoff: secs(&RATE_LIMIT_BACKOFF_SECS),
        }
    }
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}

impl RetryPolicy {
    /// `backoff_secs` is the delay before each retry; if shorter than needed, the last value is
    /// reused. Attempts are at least 1.
    pub fn new(max_attempts: u32, backoff_secs: &[u64]) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff: secs(backoff_secs),
            ..Self::default()
        }
    }

    /// Same attempt count, no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff: Vec::new(),
            rate_limit_backoff: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based) after `err`.
    fn delay(&self, retry: usize, err: &ScraperError) -> Duration {
        let schedule = if err.is_rate_limited() {
            &self.rate_limit_backoff
        } else {
            &self.backoff
        };
        schedule
            .get(retry)
            .or_else(|| schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    /// The last error is returned unchanged.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, ScraperError>,
    ) -> Result<T, ScraperError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = self.delay(attempt as usize - 1, &e);
                    tracing::debug!(
                        op = what,
                        attempt,
                        wait_secs = wait.as_secs_f32(),
                        error = %e,
                        "transient failure, retrying"
                    );
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
