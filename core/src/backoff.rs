//! Exponential backoff shared by replication task retries and durable hook
//! deliveries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Parameters of an exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "crate::config::seconds")]
    pub base: Duration,

    /// Multiplier applied after each attempt.
    pub factor: u32,

    /// Upper bound of a single delay.
    #[serde(with = "crate::config::seconds")]
    pub max: Duration,

    /// Randomize delays to spread retries out.
    pub jitter: bool,

    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(60),
            jitter: true,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// The un-jittered delay before retry number `attempt` (0 based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// The delay before retry number `attempt`, jittered if configured.
    ///
    /// Jitter keeps the delay within `[nominal / 2, nominal]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }

    /// Start tracking attempts against this policy.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// Retry state for a single operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
}

impl Backoff {
    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The delay before the next retry, or `None` once retries are exhausted.
    ///
    /// A server supplied hint (for example `Retry-After`) replaces the
    /// computed delay but still counts as a retry and is clamped to `max`.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = match hint {
            Some(hint) => hint.min(self.policy.max),
            None => self.policy.delay(self.retries),
        };
        self.retries += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            jitter,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn doubles_until_max() {
        let p = policy(false);
        let delays: Vec<_> = (0..8).map(|n| p.nominal_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(p.nominal_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy(true);
        for attempt in 0..6 {
            let nominal = p.nominal_delay(attempt);
            let delay = p.delay(attempt);
            assert!(delay <= nominal);
            assert!(delay >= nominal / 2);
        }
    }

    #[test]
    fn exhausts_after_max_retries() {
        let mut backoff = policy(false).start();
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(1)));
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(120))),
            Some(Duration::from_secs(60))
        );
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(None), None);
        assert_eq!(backoff.retries(), 3);
    }
}
