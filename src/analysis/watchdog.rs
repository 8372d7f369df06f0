// Watchdog - flags long stretches without a blink
//
// Time is sample time, so a stalled link does not trip the watchdog and
// tests need no real delays.

use crate::config::ClassifierConfig;

#[derive(Debug, Clone)]
pub struct BlinkWatchdog {
    interval_us: u64,
    /// Timestamp of the last blink, or of the first sample seen
    anchor_us: Option<u64>,
    fired: bool,
}

impl BlinkWatchdog {
    pub fn new(interval_us: u64) -> Self {
        Self {
            interval_us,
            anchor_us: None,
            fired: false,
        }
    }

    /// None when the configuration disables the watchdog
    pub fn from_config(config: &ClassifierConfig) -> Option<Self> {
        config
            .no_blink_interval_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Self::new(ms * 1_000))
    }

    /// Record one classified sample.
    ///
    /// Returns the time since the last blink the first time it reaches the
    /// interval; stays quiet until the next blink re-arms it.
    pub fn observe(&mut self, timestamp_us: u64, blinked: bool) -> Option<u64> {
        let anchor = *self.anchor_us.get_or_insert(timestamp_us);
        if blinked {
            self.anchor_us = Some(timestamp_us);
            self.fired = false;
            return None;
        }

        let since_last_us = timestamp_us.saturating_sub(anchor);
        if !self.fired && since_last_us >= self.interval_us {
            self.fired = true;
            return Some(since_last_us);
        }
        None
    }

    pub fn reset(&mut self) {
        self.anchor_us = None;
        self.fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_after_interval() {
        let mut watchdog = BlinkWatchdog::new(1_000);
        assert_eq!(watchdog.observe(500, false), None);
        assert_eq!(watchdog.observe(1_200, false), None);
        assert_eq!(watchdog.observe(1_500, false), Some(1_000));
        assert_eq!(watchdog.observe(5_000, false), None);
    }

    #[test]
    fn test_blink_rearms() {
        let mut watchdog = BlinkWatchdog::new(1_000);
        watchdog.observe(0, false);
        assert_eq!(watchdog.observe(1_000, false), Some(1_000));
        assert_eq!(watchdog.observe(1_100, true), None);
        assert_eq!(watchdog.observe(2_000, false), None);
        assert_eq!(watchdog.observe(2_300, false), Some(1_200));
    }

    #[test]
    fn test_disabled_by_config() {
        let config = ClassifierConfig {
            no_blink_interval_ms: None,
            ..ClassifierConfig::default()
        };
        assert!(BlinkWatchdog::from_config(&config).is_none());
        assert!(BlinkWatchdog::from_config(&ClassifierConfig::default()).is_some());
    }
}
