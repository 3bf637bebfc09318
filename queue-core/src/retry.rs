//! Retry policy with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum attempts for a queue mutation that keeps hitting version conflicts.
pub const MAX_RETRIES: u32 = 3;

/// Configuration for retry with exponential backoff.
///
/// Controls how conflicting or failed operations are retried, with
/// increasing delays between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Multiplier applied to delay after each retry (e.g., 2.0 for doubling).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay_ms: 10,
            max_delay_ms: 200,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom values.
    #[must_use]
    pub const fn new(
        max_retries: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
        }
    }

    /// Policy for reconnecting a dropped transport.
    #[must_use]
    pub const fn reconnect() -> Self {
        Self::new(u32::MAX, 250, 10_000, 2.0)
    }

    /// Calculate the delay for a given retry attempt (0-indexed).
    ///
    /// Uses exponential backoff: `delay = initial * multiplier^attempt`
    /// The result is capped at `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay_ms = (base_delay * multiplier).min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_uses_max_retries() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let config = RetryConfig::new(5, 100, 10_000, 2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig::new(5, 100, 300, 2.0);
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(300));
    }

    proptest! {
        #[test]
        fn prop_retry_delay_never_exceeds_max(
            initial_ms in 1u64..1000u64,
            max_ms in 100u64..10000u64,
            multiplier in 1.0f64..5.0f64,
            attempt in 0u32..200u32
        ) {
            let max_delay = initial_ms.max(max_ms);
            let config = RetryConfig::new(10, initial_ms, max_delay, multiplier);
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay.as_millis() <= u128::from(max_delay));
        }
    }
}
