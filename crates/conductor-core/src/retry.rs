use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between attempts: `base_delay * 2^(attempt-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay in milliseconds after the first failed attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Backoff starting at `base`, doubling up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Bounded retry a workflow step may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRetry {
    /// Total attempts for the step, including the first.
    pub max_attempts: u32,
    /// Delay between step attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl StepRetry {
    /// Allow `max_attempts` tries with the given backoff.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}
