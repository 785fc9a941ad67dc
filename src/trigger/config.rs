//! Timing configuration for the trigger-and-wait unit.
//!
//! # Polling Strategy
//!
//! - **Poll interval**: 15 seconds by default (`GATE_POLL_INTERVAL_SECS`)
//! - **Job timeout**: 45 minutes by default (`GATE_JOB_TIMEOUT_MINS`), measured
//!   from the moment the trigger call returns
//! - **Transient poll errors**: retried with exponential backoff, 5 consecutive
//!   failures tolerated before the node fails

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::platform::RetryConfig;

/// Default interval between status polls (15 seconds).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default job timeout (45 minutes).
const DEFAULT_JOB_TIMEOUT_MINS: u64 = 45;

/// Longest accepted poll interval or poll backoff delay (1 hour).
pub const MAX_POLL_INTERVAL_SECS: u64 = 60 * 60;

/// Longest accepted job timeout (1 week).
pub const MAX_JOB_TIMEOUT_MINS: u64 = 7 * 24 * 60;

/// A wait setting outside its accepted range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{key} = {value} is out of range {min}..={max}")]
pub struct OutOfRange {
    pub key: &'static str,
    pub value: u64,
    pub min: u64,
    pub max: u64,
}

fn in_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<u64, OutOfRange> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

fn poll_interval_secs(value: u64) -> Result<u64, OutOfRange> {
    in_range("poll_interval_secs", value, 1, MAX_POLL_INTERVAL_SECS)
}

fn timeout_mins(value: u64) -> Result<u64, OutOfRange> {
    in_range("timeout_mins", value, 1, MAX_JOB_TIMEOUT_MINS)
}

fn minutes(mins: u64) -> Duration {
    Duration::from_secs(mins.saturating_mul(60))
}

/// Configuration for waiting on a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Interval between successful polls.
    pub poll_interval: Duration,

    /// Deadline for a triggered job to reach a terminal state.
    pub timeout: Duration,

    /// Backoff for consecutive transient poll errors. `max_retries` is the
    /// number of consecutive failures tolerated.
    pub poll_retry: RetryConfig,

    /// Backoff for transient branch-existence errors.
    pub branch_check_retry: RetryConfig,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitConfig {
    pub fn new() -> Self {
        WaitConfig {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            timeout: minutes(DEFAULT_JOB_TIMEOUT_MINS),
            poll_retry: RetryConfig::POLL,
            branch_check_retry: RetryConfig::DEFAULT,
        }
    }

    /// Creates a `WaitConfig` from environment variables.
    ///
    /// Reads `GATE_POLL_INTERVAL_SECS` and `GATE_JOB_TIMEOUT_MINS`. Other
    /// values use defaults.
    pub fn from_env() -> Self {
        Self::new().with_env_overrides()
    }

    /// Applies `GATE_POLL_INTERVAL_SECS` and `GATE_JOB_TIMEOUT_MINS` on top of `self`.
    ///
    /// Unparsable or out-of-range values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, check: fn(u64) -> Result<u64, OutOfRange>| {
            let value = lookup(key)?.parse::<u64>().ok()?;
            check(value)
                .inspect_err(|e| warn!(variable = key, error = %e, "Ignoring environment override"))
                .ok()
        };
        if let Some(secs) = read("GATE_POLL_INTERVAL_SECS", poll_interval_secs) {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(mins) = read("GATE_JOB_TIMEOUT_MINS", timeout_mins) {
            self.timeout = minutes(mins);
        }
        self
    }
}

/// The `[wait]` table of the pipeline file. Absent keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSettings {
    pub poll_interval_secs: Option<u64>,
    pub timeout_mins: Option<u64>,
    pub max_poll_retries: Option<u32>,
    pub poll_backoff_initial_secs: Option<u64>,
    pub poll_backoff_max_secs: Option<u64>,
}

impl WaitSettings {
    /// Rejects a zero poll interval and durations too large to schedule.
    pub fn validate(&self) -> Result<(), OutOfRange> {
        if let Some(secs) = self.poll_interval_secs {
            poll_interval_secs(secs)?;
        }
        if let Some(mins) = self.timeout_mins {
            timeout_mins(mins)?;
        }
        if let Some(secs) = self.poll_backoff_initial_secs {
            in_range("poll_backoff_initial_secs", secs, 0, MAX_POLL_INTERVAL_SECS)?;
        }
        if let Some(secs) = self.poll_backoff_max_secs {
            in_range("poll_backoff_max_secs", secs, 0, MAX_POLL_INTERVAL_SECS)?;
        }
        Ok(())
    }
}

/// Values outside the ranges [`WaitSettings::validate`] accepts are clamped.
impl From<&WaitSettings> for WaitConfig {
    fn from(settings: &WaitSettings) -> Self {
        let mut config = WaitConfig::new();
        if let Some(secs) = settings.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs.clamp(1, MAX_POLL_INTERVAL_SECS));
        }
        if let Some(mins) = settings.timeout_mins {
            config.timeout = minutes(mins.clamp(1, MAX_JOB_TIMEOUT_MINS));
        }
        if let Some(retries) = settings.max_poll_retries {
            config.poll_retry.max_retries = retries;
        }
        if let Some(secs) = settings.poll_backoff_initial_secs {
            config.poll_retry.initial_delay = Duration::from_secs(secs.min(MAX_POLL_INTERVAL_SECS));
        }
        if let Some(secs) = settings.poll_backoff_max_secs {
            config.poll_retry.max_delay = Duration::from_secs(secs.min(MAX_POLL_INTERVAL_SECS));
        }
        config
    }
}
