//! Retry policies and backoff schedules for failed messages

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Maximum allowed retry attempts
const MAX_RETRY_ATTEMPTS: u32 = 100;
/// Maximum backoff of a single attempt (one week)
const MAX_DELAY_MINUTES: u32 = 7 * 24 * 60;

fn validate_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

fn validate_delays<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let delays = Vec::<u32>::deserialize(deserializer)?;
    if let Some(bad) = delays.iter().find(|d| **d > MAX_DELAY_MINUTES) {
        return Err(serde::de::Error::custom(format!(
            "delay {} minutes exceeds maximum allowed {} minutes",
            bad, MAX_DELAY_MINUTES
        )));
    }
    Ok(delays)
}

/// Number of allowed attempts and the backoff before each of them, in minutes.
///
/// Functions may attach their own policy to a retry error; it is clamped to
/// the process-wide [`RetrySettings`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries before dead-lettering
    #[serde(deserialize_with = "validate_retries")]
    pub retries: u32,
    /// Backoff per attempt in minutes. The last entry repeats when there are
    /// fewer delays than retries.
    #[serde(deserialize_with = "validate_delays")]
    pub delays: Vec<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().default_policy()
    }
}

impl RetryPolicy {
    /// Exponential schedule: `delay[i] = min(base^(i+1), max_delay)`
    pub fn exponential(retries: u32, base: u32, max_delay_minutes: u32) -> Self {
        let delays = (0..retries)
            .map(|i| {
                base.checked_pow(i + 1)
                    .unwrap_or(u32::MAX)
                    .min(max_delay_minutes)
            })
            .collect();
        Self { retries, delays }
    }

    /// Policy that dead-letters on the first failure
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            delays: vec![],
        }
    }

    /// Check if another attempt is allowed after `attempt` failures so far
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retries
    }

    /// Backoff before the retry following `attempt` failures
    pub fn delay_minutes(&self, attempt: u32) -> u32 {
        if self.delays.is_empty() {
            return 0;
        }
        let idx = (attempt as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// When the next attempt should run, or `None` when the message must be
    /// dead-lettered.
    pub fn next_retry_time(&self, attempt: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_retry(attempt) {
            return None;
        }
        let delay = self.delay_minutes(attempt);
        debug!(attempt, delay_minutes = delay, "Calculated retry backoff");
        Some(now + ChronoDuration::minutes(delay as i64))
    }

    /// Clamp attempts and delays to process-wide limits
    pub fn clamp(&self, settings: &RetrySettings) -> Self {
        Self {
            retries: self.retries.min(settings.max_retries),
            delays: self
                .delays
                .iter()
                .map(|d| (*d).min(settings.max_delay_minutes))
                .collect(),
        }
    }
}

/// Process-wide retry limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Default and maximum number of retries
    pub max_retries: u32,
    /// Exponential base in minutes
    pub backoff_base: u32,
    /// Upper bound for a single delay
    pub max_delay_minutes: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: 5,
            max_delay_minutes: 24 * 60,
        }
    }
}

impl RetrySettings {
    /// Policy applied when the error carries none
    pub fn default_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.backoff_base, self.max_delay_minutes)
    }

    /// Effective policy for an error: its override clamped, else the default
    pub fn policy_for(&self, override_policy: Option<&RetryPolicy>) -> RetryPolicy {
        match override_policy {
            Some(p) => p.clamp(self),
            None => self.default_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::exponential(5, 5, 1440);
        assert_eq!(policy.delays, vec![5, 25, 125, 625, 1440]);

        let capped = RetryPolicy::exponential(3, 2, 3);
        assert_eq!(capped.delays, vec![2, 3, 3]);
    }

    #[test]
    fn test_exponential_overflow_is_capped() {
        let policy = RetryPolicy::exponential(40, 10, 60);
        assert!(policy.delays.iter().all(|d| *d == 10 || *d == 60));
        assert_eq!(policy.delays.len(), 40);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::exponential(3, 2, 60);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn test_next_retry_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = RetryPolicy {
            retries: 3,
            delays: vec![1, 10],
        };
        assert_eq!(
            policy.next_retry_time(0, now),
            Some(now + ChronoDuration::minutes(1))
        );
        // last delay repeats
        assert_eq!(
            policy.next_retry_time(2, now),
            Some(now + ChronoDuration::minutes(10))
        );
        assert_eq!(policy.next_retry_time(3, now), None);
    }

    #[test]
    fn test_override_is_clamped() {
        let settings = RetrySettings {
            max_retries: 2,
            backoff_base: 5,
            max_delay_minutes: 30,
        };
        let custom = RetryPolicy {
            retries: 10,
            delays: vec![1, 100],
        };
        let effective = settings.policy_for(Some(&custom));
        assert_eq!(effective.retries, 2);
        assert_eq!(effective.delays, vec![1, 30]);
        assert_eq!(settings.policy_for(None), RetryPolicy::exponential(2, 5, 30));
    }

    #[test]
    fn test_retry_policy_validation() {
        let valid: Result<RetryPolicy, _> =
            serde_json::from_str(r#"{"retries": 3, "delays": [1, 5, 10]}"#);
        assert!(valid.is_ok());

        let too_many: Result<RetryPolicy, _> =
            serde_json::from_str(r#"{"retries": 10000, "delays": [1]}"#);
        assert!(too_many.is_err());

        let too_long: Result<RetryPolicy, _> =
            serde_json::from_str(r#"{"retries": 1, "delays": [99999999]}"#);
        assert!(too_long.is_err());
    }
}
