//! Reconnect policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait before the next connect attempt.
///
/// Reconnection never gives up; the policy only shapes the spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay after every failure.
    Constant {
        /// Delay in milliseconds.
        interval_ms: u64,
    },
    /// Doubling delay, capped.
    Exponential {
        /// Delay after the first failure, in milliseconds.
        initial_ms: u64,
        /// Upper bound, in milliseconds.
        max_ms: u64,
    },
}

impl RetryPolicy {
    /// A constant policy.
    #[must_use]
    pub const fn constant(interval: Duration) -> Self {
        RetryPolicy::Constant {
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `failures` is 0 right after a connection that was open has closed.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            RetryPolicy::Constant { interval_ms } => Duration::from_millis(interval_ms),
            RetryPolicy::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Constant { interval_ms: 10_000 }
    }
}
