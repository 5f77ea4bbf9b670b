//! Retry delay policy for failed handler invocations.
//!
//! Maps the number of recorded failures to the wait before the next
//! attempt. The default cubic curve widens gaps quickly, which suits a
//! downstream API that may stay down for hours. Every strategy is
//! non-decreasing in the attempt count and returns zero for no attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * attempts^3 * 2`.
    #[default]
    Cubic,
    /// `base * 2^(attempts - 1)`.
    Exponential,
    /// `base * attempts`.
    Linear,
    /// `base` for every retry.
    Fixed,
}

/// Backoff policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Unit delay the strategy scales.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Strategy for calculating delays.
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            strategy: BackoffStrategy::Cubic,
        }
    }
}

impl BackoffPolicy {
    /// Creates a cubic policy with the given base delay and no cap.
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay, ..Self::default() }
    }

    /// Caps every delay at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Switches the delay curve.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the wait before the next attempt given `attempts` recorded
    /// failures.
    ///
    /// Arithmetic saturates, so very large attempt counts yield the cap
    /// rather than wrapping.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let n = u128::from(attempts);
        let multiplier: u128 = match self.strategy {
            BackoffStrategy::Cubic => n.saturating_pow(3).saturating_mul(2),
            BackoffStrategy::Exponential => 1u128.checked_shl(attempts - 1).unwrap_or(u128::MAX),
            BackoffStrategy::Linear => n,
            BackoffStrategy::Fixed => 1,
        };

        let nanos = self.base_delay.as_nanos().saturating_mul(multiplier);
        let capped = nanos.min(self.max_delay.as_nanos());

        match u64::try_from(capped) {
            Ok(nanos) => Duration::from_nanos(nanos),
            Err(_) => {
                let secs = u64::try_from(capped / 1_000_000_000).unwrap_or(u64::MAX);
                Duration::from_secs(secs)
            },
        }
    }

    /// Returns the time of the next attempt after `attempts` failures,
    /// counted from `now`.
    ///
    /// Saturates at the latest representable timestamp.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
