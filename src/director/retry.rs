//! Backoff applied to `scheduled` when a failed attempt is requeued.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on any retry delay (30 days).
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// No delay; retries are eligible as soon as the attempt finishes.
    pub fn immediate() -> Self {
        RetryPolicy::Fixed(Duration::ZERO)
    }

    /// Delay after the `attempt`-th execution failed (1-based), never more
    /// than [`MAX_RETRY_DELAY`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        };
        delay.min(MAX_RETRY_DELAY)
    }

    pub fn retry_at(&self, finished: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempt))
            .ok()
            .and_then(|delay| finished.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// `fixed:<ms>` or `exponential:<base_ms>:<max_ms>`.
impl FromStr for RetryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Config(format!("invalid retry policy '{s}'"));
        let ms = |v: &str| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .ok()
                .filter(|d| *d <= MAX_RETRY_DELAY)
                .ok_or_else(bad)
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["fixed", delay] => Ok(RetryPolicy::Fixed(ms(*delay)?)),
            ["exponential", base, max] => Ok(RetryPolicy::Exponential {
                base: ms(*base)?,
                max: ms(*max)?,
            }),
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn fixed_is_constant() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(250));
        assert_eq!(policy.delay(1), policy.delay(9));
    }

    #[test]
    fn parses_from_config_strings() {
        assert_eq!(
            "fixed:1000".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Fixed(Duration::from_secs(1))
        );
        assert_eq!(
            "exponential:500:60000".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(60)
            }
        );
        assert!("linear:5".parse::<RetryPolicy>().is_err());
        assert!("fixed:soon".parse::<RetryPolicy>().is_err());
    }

    #[test]
    fn oversized_delays_are_rejected_or_capped() {
        assert!("fixed:18446744073709551615".parse::<RetryPolicy>().is_err());
        assert!(
            format!("exponential:1000:{}", MAX_RETRY_DELAY.as_millis() + 1)
                .parse::<RetryPolicy>()
                .is_err()
        );

        let finished = Utc::now();
        let policy = RetryPolicy::Fixed(Duration::MAX);
        assert_eq!(policy.delay(1), MAX_RETRY_DELAY);
        assert_eq!(
            policy.retry_at(finished, 1),
            finished + chrono::Duration::days(30)
        );
        assert_eq!(
            policy.retry_at(DateTime::<Utc>::MAX_UTC, 1),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
