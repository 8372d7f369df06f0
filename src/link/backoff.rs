//! Reconnect delay policy.

use std::time::Duration;

use rand::Rng;

use crate::config::LinkConfig;

/// Exponential backoff with optional equal jitter.
///
/// Attempt `n` (1-based) waits `min(cap, base * 2^(n-1))`; with jitter the
/// wait is drawn uniformly from the upper half of that interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32, jitter: bool) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            jitter,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_cap_ms),
            config.max_reconnect_attempts,
            config.jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay to sleep before `attempt`, or None once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return Some(ceiling);
        }
        let half = ceiling / 2;
        let spread = ceiling - half;
        let extra = rand::thread_rng().gen_range(0..=spread.as_millis() as u64);
        Some(half + Duration::from_millis(extra))
    }
}
