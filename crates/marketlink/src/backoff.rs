use std::time::Duration;

use rand::Rng;

/// Reconnect/backoff policy for a channel.
///
/// The delay before retry `n` (zero-based) is `base_delay * factor^n`,
/// capped at `max_delay`. Reconnection stops once `max_retries` unclean
/// closes have been absorbed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            factor: 1.5,
            jitter: 0.0,
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("Base reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("Max reconnect delay must be >= base reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Whether a channel that has already retried `retry_count` times may retry again.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay to wait before the reconnect that follows `retry_count` prior retries.
    ///
    /// With jitter `j`, the delay is drawn from `[(1 - j) * d, d]` where `d`
    /// is the capped exponential delay.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let capped = (self.base_delay.as_secs_f64() * self.factor.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        if self.jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let shrink = rand::rng().random_range(0.0..=self.jitter);
        Duration::from_secs_f64(capped * (1.0 - shrink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_reconnect_schedule() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(3000));
        assert_eq!(config.delay_for(1), Duration::from_millis(4500));
        assert_eq!(config.delay_for(2), Duration::from_millis(6750));
        assert_eq!(config.delay_for(3), Duration::from_millis(10125));
    }

    #[test]
    fn delay_is_capped() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            factor: 2.0,
            jitter: 0.0,
            max_retries: 10,
        };
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for(9), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_base() {
        let config = BackoffConfig {
            jitter: 0.5,
            ..BackoffConfig::default()
        };
        for _ in 0..64 {
            let delay = config.delay_for(2);
            assert!(delay <= Duration::from_millis(6750));
            assert!(delay >= Duration::from_millis(3375));
        }
    }

    #[test]
    fn retry_budget() {
        let config = BackoffConfig::default();
        assert!(config.can_retry(0));
        assert!(config.can_retry(4));
        assert!(!config.can_retry(5));
        assert!(!config.can_retry(6));
    }

    #[test]
    fn validation() {
        assert!(BackoffConfig::default().validate().is_ok());

        let config = BackoffConfig {
            factor: 0.5,
            ..BackoffConfig::default()
        };
        assert_eq!(config.validate().unwrap_err(), "Backoff factor must be >= 1.0");

        let config = BackoffConfig {
            base_delay: Duration::ZERO,
            ..BackoffConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
