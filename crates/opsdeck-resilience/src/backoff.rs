//! Exponential backoff with multiplicative jitter.
//!
//! The base delay for attempt `n` is `base × multiplier^n`, clamped to `max`.
//! With jitter enabled the clamped delay is scaled by a factor drawn uniformly
//! from `[0.5, 1.0]`, so a jittered delay never exceeds its un-jittered value.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lower bound of the jitter scale factor.
pub const JITTER_FLOOR: f64 = 0.5;

/// Parameters for delay growth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(rename = "base_ms", with = "opsdeck_core::serde_duration::millis")]
    pub base: Duration,
    /// Cap on any single delay.
    #[serde(rename = "max_ms", with = "opsdeck_core::serde_duration::millis")]
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for the given attempt (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Apply the configured jitter to a delay.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(JITTER_FLOOR..=1.0);
        delay.mul_f64(factor)
    }
}

/// Attempt counter driving a [`BackoffPolicy`].
///
/// Shared by reference between everyone retrying the same resource, so
/// concurrent failures keep escalating one delay sequence.
#[derive(Debug, Default)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: Mutex<u32>,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: Mutex::new(0),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&self) -> Duration {
        let delay = {
            let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
            let delay = self.policy.delay_for(*attempt);
            *attempt = attempt.saturating_add(1);
            delay
        };
        self.policy.jittered(delay)
    }

    /// Return to attempt 0.
    pub fn reset(&self) {
        *self.attempt.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        *self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
