//! Batcher Configuration
//!
//! Every batcher gets its own explicit configuration: size threshold,
//! flush interval and retry policy. Durations serialize as milliseconds.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for one [`Batcher`](crate::batch::Batcher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pending entries that force an immediate flush from `add` (default: 1000)
    pub max_size: usize,
    /// Interval of the background ticker (default: 60s)
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Commit retry policy
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_size: 1000,
            flush_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchConfig {
    /// Configuration for testing (tiny threshold, fast ticks, no backoff)
    pub fn test() -> Self {
        BatchConfig {
            max_size: 16,
            flush_interval: Duration::from_millis(20),
            retry: RetryPolicy::immediate(3),
        }
    }

    pub fn with_max_size(self, max_size: usize) -> Self {
        BatchConfig { max_size, ..self }
    }

    pub fn with_flush_interval(self, flush_interval: Duration) -> Self {
        BatchConfig {
            flush_interval,
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        BatchConfig { retry, ..self }
    }
}

/// How a failed commit is retried inside one tick.
///
/// Attempts are synchronous on the flushing thread. Between attempts the
/// thread sleeps for an exponential backoff starting at `initial_backoff`
/// and capped at `max_backoff`; a zero `initial_backoff` retries at once.
/// When `deadline` is set, no attempt is started (backoff included) past
/// that much time after the first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total commit attempts per tick, first one included (0 is treated as 1)
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::immediate(3)
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            deadline: None,
        }
    }

    /// Exponential backoff between attempts
    pub fn exponential(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff,
            deadline: None,
        }
    }

    pub fn with_deadline(self, deadline: Duration) -> Self {
        RetryPolicy {
            deadline: Some(deadline),
            ..self
        }
    }

    #[inline]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep before attempt `failed_attempts + 1`.
    pub fn backoff_after(&self, failed_attempts: u32) -> Duration {
        if self.initial_backoff.is_zero() || failed_attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (failed_attempts - 1).min(16);
        let backoff = self.initial_backoff.saturating_mul(1u32 << shift);
        if self.max_backoff.is_zero() {
            backoff
        } else {
            backoff.min(self.max_backoff)
        }
    }

    /// Whether attempt `failed_attempts + 1` may start, after its backoff,
    /// for a flush that began at `started`.
    pub fn may_retry(&self, failed_attempts: u32, started: Instant) -> bool {
        if failed_attempts >= self.attempts() {
            return false;
        }
        match self.deadline {
            Some(deadline) => started.elapsed() + self.backoff_after(failed_attempts) < deadline,
            None => true,
        }
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.flush_interval, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.deadline.is_none());
    }

    #[test]
    fn test_test_config() {
        let config = BatchConfig::test();
        assert_eq!(config.max_size, 16);
        assert_eq!(config.retry.backoff_after(1), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.may_retry(1, Instant::now()));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(10),
            Duration::from_millis(35),
        );
        assert_eq!(policy.backoff_after(0), Duration::ZERO);
        assert_eq!(policy.backoff_after(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(35));
        assert_eq!(policy.backoff_after(30), Duration::from_millis(35));
    }

    #[test]
    fn test_deadline_stops_retries() {
        let policy = RetryPolicy::immediate(10).with_deadline(Duration::ZERO);
        assert!(!policy.may_retry(1, Instant::now()));

        let policy = RetryPolicy::immediate(10).with_deadline(Duration::from_secs(60));
        assert!(policy.may_retry(1, Instant::now()));
        assert!(!policy.may_retry(10, Instant::now()));
    }

    #[test]
    fn test_config_serialization() {
        let config = BatchConfig::test().with_retry(
            RetryPolicy::exponential(4, Duration::from_millis(5), Duration::from_millis(50))
                .with_deadline(Duration::from_secs(2)),
        );
        let json = serde_json::to_string(&config).unwrap();
        let parsed: BatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: BatchConfig = toml::from_str("max_size = 5\n").unwrap();
        assert_eq!(parsed.max_size, 5);
        assert_eq!(parsed.flush_interval, Duration::from_secs(60));
        assert_eq!(parsed.retry, RetryPolicy::default());
    }
}
