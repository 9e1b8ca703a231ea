//! Retry backoff and dead-letter decisions.
//!
//! ## Delay
//!
//! `delay(attempt) = min(max_retry_delay, min_retry_delay * 2^(attempt - 1))`
//!
//! so with the defaults (10s / 10m) a failing message waits 10s, 20s, 40s, ...
//! until the delay saturates at ten minutes.
//!
//! ## Jitter
//!
//! [`JitterMode::Full`] replaces the computed delay with a uniform sample in
//! `[0, delay]`. The sample comes from an injected [`RandomSource`] so the
//! schedule stays reproducible in tests.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_MAX_RETRIES, MaxRetries, RetryPolicy};

/// Exponential delay before the next attempt, after `attempt` failed attempts.
///
/// Attempt `0` is treated as attempt `1`. Never exceeds `max_retry_delay` and
/// never drops below `min_retry_delay`.
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 1u32.checked_shl(exponent).unwrap_or(0);

    let delay = if factor == 0 {
        policy.max_retry_delay
    } else {
        policy
            .min_retry_delay
            .checked_mul(factor)
            .unwrap_or(policy.max_retry_delay)
    };

    delay.min(policy.max_retry_delay).max(policy.min_retry_delay.min(policy.max_retry_delay))
}

/// Whether a message that has failed `attempt` times should be dead-lettered.
pub fn should_dead_letter(attempt: u32, policy: &RetryPolicy) -> bool {
    match policy.max_retries {
        MaxRetries::Immediate => attempt >= 1,
        MaxRetries::Finite(n) => attempt >= n.get(),
        MaxRetries::Infinite => false,
        MaxRetries::UseDefault => attempt >= DEFAULT_MAX_RETRIES,
    }
}

/// Jitter applied on top of [`next_delay`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Use the exponential delay as-is.
    #[default]
    None,
    /// Replace the delay with a uniform sample in `[0, delay]`.
    Full,
}

/// Source of uniform samples in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Thread-local RNG backed by `rand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_unit(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Always yields the same sample (clamped into `[0, 1]`, NaN reads as 0).
/// For tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_unit(&self) -> f64 {
        unit_interval(self.0)
    }
}

/// Clamp a sample into `[0, 1]`. NaN maps to 0.
fn unit_interval(sample: f64) -> f64 {
    if sample.is_nan() {
        0.0
    } else {
        sample.clamp(0.0, 1.0)
    }
}

/// Backoff calculator: exponential delay plus optional jitter.
pub struct Backoff {
    mode: JitterMode,
    random: Box<dyn RandomSource>,
}

impl Backoff {
    pub fn new(mode: JitterMode, random: impl RandomSource + 'static) -> Self {
        Self {
            mode,
            random: Box::new(random),
        }
    }

    /// No jitter.
    pub fn exact() -> Self {
        Self::new(JitterMode::None, ThreadRandom)
    }

    pub fn mode(&self) -> JitterMode {
        self.mode
    }

    /// Delay before the next attempt, after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32, policy: &RetryPolicy) -> Duration {
        let delay = next_delay(attempt, policy);
        match self.mode {
            JitterMode::None => delay,
            JitterMode::Full => delay.mul_f64(unit_interval(self.random.next_unit())),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exact()
    }
}

impl core::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backoff").field("mode", &self.mode).finish_non_exhaustive()
    }
}
