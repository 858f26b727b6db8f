//! Exponential backoff for tiers whose drains keep failing.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Never retry sooner than the current network strategy allows.
    #[serde(default = "default_true")]
    pub strategy_floor: bool,
}

fn default_true() -> bool {
    true
}

impl BackoffConfig {
    /// Create a configuration with the given initial delay and defaults for
    /// the rest.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
            strategy_floor: true,
        }
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Enable or disable the network strategy's retry delay as a lower bound.
    pub fn with_strategy_floor(mut self, enabled: bool) -> Self {
        self.strategy_floor = enabled;
        self
    }

    /// Delay after `failures` consecutive failures (1-based).
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(failures as i32 - 1);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Consecutive-failure counter of one tier.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    consecutive_failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    /// Record a failed drain and return how long the tier should wait.
    ///
    /// `floor` is the retry delay of the current network strategy.
    pub fn record_failure(&mut self, config: &BackoffConfig, floor: Duration) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let mut delay = config.delay_for_failures(self.consecutive_failures);
        if config.strategy_floor {
            delay = delay.max(floor);
        }
        self.until = Some(Instant::now() + delay);
        delay
    }

    /// Reset after a successful drain.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.until = None;
    }

    /// Whether the tier must still wait at `now`.
    pub fn is_waiting(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// When the current wait ends.
    pub fn until(&self) -> Option<Instant> {
        self.until
    }

    /// Number of failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig::new(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_failures(0), Duration::ZERO);
        assert_eq!(config.delay_for_failures(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_failures(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_failures(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        // 1 * 10^5 seconds, capped at 10
        assert_eq!(config.delay_for_failures(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = BackoffConfig::new(Duration::from_secs(8))
            .with_max_delay(Duration::from_secs(10));
        for _ in 0..50 {
            let delay = config.delay_for_failures(3);
            assert!(delay <= Duration::from_secs(10));
            assert!(delay >= Duration::from_millis(7_500));
        }
    }

    #[tokio::test]
    async fn test_backoff_resets_on_success() {
        let config = BackoffConfig::new(Duration::from_secs(60)).with_jitter(false);
        let mut backoff = Backoff::default();

        backoff.record_failure(&config, Duration::ZERO);
        backoff.record_failure(&config, Duration::ZERO);
        assert_eq!(backoff.consecutive_failures(), 2);
        assert!(backoff.is_waiting(Instant::now()));

        backoff.reset();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert!(!backoff.is_waiting(Instant::now()));
    }

    #[tokio::test]
    async fn test_zero_delay_does_not_wait() {
        let config = BackoffConfig::new(Duration::ZERO)
            .with_jitter(false)
            .with_strategy_floor(false);
        let mut backoff = Backoff::default();
        backoff.record_failure(&config, Duration::from_secs(30));
        assert!(!backoff.is_waiting(Instant::now()));
    }

    #[tokio::test]
    async fn test_strategy_delay_is_lower_bound() {
        let config = BackoffConfig::new(Duration::from_millis(100)).with_jitter(false);
        let mut backoff = Backoff::default();

        let delay = backoff.record_failure(&config, Duration::from_secs(10));
        assert_eq!(delay, Duration::from_secs(10));
        assert!(backoff.is_waiting(Instant::now() + Duration::from_secs(9)));

        let longer = BackoffConfig::new(Duration::from_secs(60)).with_jitter(false);
        assert_eq!(backoff.record_failure(&longer, Duration::from_secs(10)), Duration::from_secs(120));
    }
}
