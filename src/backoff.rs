// src/backoff.rs
use serde::Deserialize;
use std::time::Duration;

/// Retry delay after consecutive query failures.
///
/// The delay doubles with each failure up to `max_failures`, then holds:
/// `base, 2*base, 4*base, ...` capped at `base * 2^(max_failures - 1)`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Failure count at which the delay stops growing
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_failures: default_max_failures(),
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let steps = failures.min(self.max_failures.max(1)) - 1;
        let factor = 1u64.checked_shl(steps).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Bump a failure counter, never past `max_failures`.
    pub fn next_failure(&self, failures: u32) -> u32 {
        failures.saturating_add(1).min(self.max_failures.max(1))
    }

    /// The longest delay this policy will ever produce.
    pub fn plateau(&self) -> Duration {
        self.delay(self.max_failures.max(1))
    }
}

fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_failures() -> u32 {
    3
}
