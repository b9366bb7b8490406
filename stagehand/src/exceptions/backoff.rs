//! Backoff for retryable task failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubles every retry.
    #[default]
    Exponential,
    /// Grows by `base_delay_ms` every retry.
    Linear,
    /// Always `base_delay_ms`.
    Constant,
}

/// Randomization applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Uniform in `0..=delay`.
    Full,
    /// `delay / 2` plus a uniform share of the other half.
    Equal,
    /// Uniform between the base and three times the previous delay.
    Decorrelated,
}

/// Retry policy for failures the classifier marks retryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum attempts per task, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Growth of the delay across retries.
    pub backoff_strategy: BackoffStrategy,
    /// Randomization of each delay.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// The default policy: five attempts, exponential from one second.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps attempts per task, the first one included.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Sets the upper bound on a delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Sets how delays grow.
    #[must_use]
    pub fn with_backoff(mut self, backoff_strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = backoff_strategy;
        self
    }

    /// Sets how delays are randomized.
    #[must_use]
    pub fn with_jitter(mut self, jitter_strategy: JitterStrategy) -> Self {
        self.jitter_strategy = jitter_strategy;
        self
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    #[must_use]
    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    fn unjittered_ms(&self, retry: u32) -> u64 {
        let step = match self.backoff_strategy {
            BackoffStrategy::Exponential => 2u64.saturating_pow(retry),
            BackoffStrategy::Linear => u64::from(retry) + 1,
            BackoffStrategy::Constant => 1,
        };
        self.base_delay_ms.saturating_mul(step).min(self.max_delay_ms)
    }

    /// Delay before the `retry`-th retry, counting from zero.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.unjittered_ms(retry);
        let mut rng = rand::thread_rng();

        let millis = match self.jitter_strategy {
            JitterStrategy::None => ceiling,
            JitterStrategy::Full if ceiling > 0 => rng.gen_range(0..=ceiling),
            JitterStrategy::Full => 0,
            JitterStrategy::Equal if ceiling >= 2 => {
                let fixed = ceiling / 2;
                fixed + rng.gen_range(0..=fixed)
            }
            JitterStrategy::Equal => ceiling,
            JitterStrategy::Decorrelated => {
                let floor = self.base_delay_ms;
                let previous = retry
                    .checked_sub(1)
                    .map_or(floor, |prior| self.unjittered_ms(prior));
                let upper = previous.saturating_mul(3).min(self.max_delay_ms);
                if upper > floor {
                    rng.gen_range(floor..=upper)
                } else {
                    floor
                }
            }
        };

        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_are_capped() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000);
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let constant = RetryConfig::new()
            .with_base_delay_ms(250)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn test_full_jitter_stays_within_bounds() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..50 {
            assert!(config.delay_for(2) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_decorrelated_jitter_is_at_least_base() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(10_000)
            .with_jitter(JitterStrategy::Decorrelated);
        for retry in 0..5 {
            assert!(config.delay_for(retry) >= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_attempt_bound() {
        let config = RetryConfig::new().with_max_attempts(3);
        assert!(config.allows_another_attempt(2));
        assert!(!config.allows_another_attempt(3));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"maxAttempts": 2}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.base_delay_ms, 1000);
    }
}
