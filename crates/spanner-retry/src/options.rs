//! Retry policy configuration.

use std::sync::Arc;
use std::time::Duration;

use asupersync::combinator::retry::{RetryPolicy, calculate_delay};
use asupersync::util::DetRng;
use serde::{Deserialize, Serialize};
use spanner_core::Error;

use crate::clock::{Clock, SystemClock};

/// Default maximum number of internal retries per transaction.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Default cap on the cumulative time spent retrying one transaction.
pub const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_secs(15 * 60);

/// Configuration for internal abort retries.
///
/// # Example
///
/// ```ignore
/// let options = RetryOptions::new()
///     .max_retries(10)
///     .max_retry_time(Duration::from_secs(30))
///     .initial_backoff(Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Replay aborted transactions internally (default: true).
    /// When false, aborts surface to the caller unchanged.
    pub enable_internal_retries: bool,
    /// Maximum number of retries before giving up (default: 100)
    pub max_retries: u32,
    /// Maximum cumulative time spent retrying, backoff included (default: 15 minutes)
    pub max_retry_time: Duration,
    /// Delay before the first retry (default: 5ms)
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff delay, before jitter (default: 32s)
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays (default: 2.0)
    pub backoff_multiplier: f64,
    /// Largest random fraction added on top of each delay, in `[0, 1]` (default: 0.2)
    pub jitter: f64,
    /// Time source and scheduler used for backoff
    #[serde(skip, default = "default_clock")]
    pub clock: Arc<dyn Clock>,
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enable_internal_retries: true,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_time: DEFAULT_MAX_RETRY_TIME,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(32),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            clock: default_clock(),
        }
    }
}

impl RetryOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> spanner_core::Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("invalid retry options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Check that the numeric settings are usable.
    pub fn validate(&self) -> spanner_core::Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidArgument(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::InvalidArgument(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    pub fn enable_internal_retries(mut self, enabled: bool) -> Self {
        self.enable_internal_retries = enabled;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn max_retry_time(mut self, max: Duration) -> Self {
        self.max_retry_time = max;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Use a custom clock, e.g. a [`VirtualClock`](crate::VirtualClock) in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Exponential backoff policy built from these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_retries.saturating_add(1))
            .with_initial_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }

    /// Backoff before retry number `attempt` (1-based).
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`.
    /// With an `rng`, up to `jitter` of the capped delay is added on top.
    pub fn backoff(&self, attempt: u32, rng: Option<&mut DetRng>) -> Duration {
        calculate_delay(&self.retry_policy(), attempt, rng)
    }
}
