//! Exponential backoff for transient chunk failures.
//!
//! The HTTP layer only classifies; [`RetryPolicy`] decides whether a failed
//! chunk is attempted again and how long to wait first.
//!
//! Only [`ErrorKind::RetryLater`] and [`ErrorKind::NetworkFailed`] are retried.
//! A `Retry-After` delay carried on the error is used as a floor for the
//! backoff delay.
//!
//! # Example
//!
//! ```
//! use onedrive_core::error::{ApiError, ErrorKind};
//! use onedrive_core::transfer::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let error = ApiError::new(ErrorKind::RetryLater, "throttled");
//!
//! match policy.should_retry(&error, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::error::{ApiError, ErrorKind};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt`.
    Retry {
        /// How long to wait.
        delay: Duration,
        /// Number of the next attempt (1-indexed).
        attempt: u32,
    },
    /// Give up and surface the error.
    DoNotRetry {
        /// Why no retry is made.
        reason: String,
    },
}

/// Backoff configuration.
///
/// `delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter`,
/// raised to the server's `Retry-After` when that is longer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    /// Custom policy. `max_attempts` counts the first attempt and is at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Default delays with `max_retries` retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(
            max_retries.saturating_add(1),
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
    }

    /// Overrides the jitter bound.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt number `attempt` (1-indexed) failed with `error`.
    #[instrument(level = "debug", skip(self, error), fields(kind = %error.kind(), max_attempts = self.max_attempts))]
    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> RetryDecision {
        let kind = error.kind();
        if !kind.is_transient() {
            let reason = if kind == ErrorKind::ReauthRequired {
                "authentication required - sign in again".to_string()
            } else {
                format!("{kind} is not transient")
            };
            return RetryDecision::DoNotRetry { reason };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let mut delay = self.calculate_delay(attempt);
        if let Some(floor) = error.retry_after() {
            delay = delay.max(floor);
        }
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
