//! Backoff policies for remote platform calls.
//!
//! | Policy                 | Retries | Delays                 | Used for                         |
//! |------------------------|---------|------------------------|----------------------------------|
//! | [`RetryConfig::DEFAULT`] | 3     | 2s, 4s, 8s             | branch checks, listing, statuses |
//! | [`RetryConfig::POLL`]    | 5     | 2s doubling, 60s cap   | consecutive poll failures        |
//!
//! Permanent errors end a retry loop at once.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::PlatformError;

/// Exponential backoff: `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
        backoff_multiplier: 2.0,
    };

    /// Rides out a platform hiccup of about a minute (2+4+8+16+32 seconds).
    pub const POLL: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runs `operation` until it succeeds, fails permanently, or `config` runs
/// out of retries. The last error is returned in the latter two cases.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut retries = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };

        if retries == config.max_retries {
            warn!(attempts = retries + 1, error = %err, "Giving up on transient platform error");
            return Err(err);
        }

        let delay = config.delay_for_attempt(retries);
        retries += 1;
        debug!(retry = retries, ?delay, error = %err, "Retrying transient platform error");
        tokio::time::sleep(delay).await;
    }
}
